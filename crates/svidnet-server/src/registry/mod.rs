//! 身份注册表模块
//!
//! 保存工作负载选择器到 SPIFFE 身份的映射，纯数据与查找，不涉及网络。

mod selector;
mod entry_store;

pub use selector::{all_match, Selector, WorkloadAttributes};
pub use entry_store::{IdentityRegistry, RegistryEntry};
