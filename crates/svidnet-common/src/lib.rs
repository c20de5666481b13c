//! SVIDNet Common - 跨模块共享工具与数据结构
//!
//! 该模块提供签发端与验证端共享的数据结构、错误处理和时钟抽象。
//! 包括 SPIFFE ID、JWT-SVID 紧凑编码、密钥集发布格式以及统一的错误分类。

pub mod models;
pub mod error;
pub mod clock;

/// 重新导出常用类型，方便使用
pub use error::{Error, ErrorKind, Result};
pub use models::keys::*;
pub use models::spiffe::*;
pub use models::svid::*;
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
