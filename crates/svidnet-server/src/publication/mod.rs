//! 公钥发布模块

mod http;
mod key_set;
mod rate_limit;

pub use http::{PublicationServer, DISCOVERY_PATH, KEYS_PATH, METRICS_PATH};
pub use key_set::{KeyPublication, RenderedKeySet};
pub use rate_limit::TokenBucket;
