//! 数据模型模块
//!
//! 该模块定义了 SVIDNet 项目中使用的核心数据模型，包括 SPIFFE ID、
//! JWT-SVID 以及公钥发布格式，并提供序列化/反序列化功能。

pub mod spiffe;
pub mod svid;
pub mod keys;
