//! 签发机构模块
//!
//! 持有签名私钥与信任域信息，负责签发 JWT-SVID 以及签名密钥的轮换。

mod key_manager;
mod signer;

pub use key_manager::{KeyManager, KeyRing, RetiringKey, RevokedKey, SigningKey};
pub use signer::SigningAuthority;
