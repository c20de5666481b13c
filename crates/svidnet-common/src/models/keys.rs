//! 公钥材料与密钥集发布格式
//!
//! 签发机构只对外发布公钥投影。发布文档形如：
//!
//! ```json
//! {"keys": [{"key_id": "...", "algorithm": "ES256", "public_key": "<base64url>", "status": "active"}]}
//! ```

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// 签名算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// P-256 ECDSA + SHA-256
    #[serde(rename = "ES256")]
    Es256,
    /// Ed25519
    #[serde(rename = "EdDSA")]
    EdDsa,
}

impl KeyAlgorithm {
    /// JWS 中使用的算法名
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Es256 => "ES256",
            KeyAlgorithm::EdDsa => "EdDSA",
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ES256" | "es256" => Ok(KeyAlgorithm::Es256),
            "EdDSA" | "eddsa" | "ed25519" => Ok(KeyAlgorithm::EdDsa),
            _ => Err(Error::Config(format!("不支持的签名算法: {}", s))),
        }
    }
}

/// 密钥状态，只能按 active → retiring → revoked 单调迁移
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// 当前签名密钥
    Active,
    /// 已轮换，仅用于验证宽限期内签发的文档
    Retiring,
    /// 已吊销，不可再用于验证
    Revoked,
}

impl KeyStatus {
    /// 该状态下的公钥是否可以用于验证
    pub fn is_usable(&self) -> bool {
        matches!(self, KeyStatus::Active | KeyStatus::Retiring)
    }

    /// 是否允许迁移到目标状态
    pub fn can_transition_to(&self, next: KeyStatus) -> bool {
        matches!(
            (self, next),
            (KeyStatus::Active, KeyStatus::Retiring) | (KeyStatus::Retiring, KeyStatus::Revoked)
        )
    }
}

/// 对外发布的公钥
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedKey {
    /// 密钥 ID
    pub key_id: String,
    /// 签名算法
    pub algorithm: KeyAlgorithm,
    /// 公钥原始字节的 base64url 编码（ES256 为未压缩点，EdDSA 为 32 字节公钥）
    pub public_key: String,
    /// 密钥状态
    pub status: KeyStatus,
}

impl PublishedKey {
    /// 由原始公钥字节构造
    pub fn new(key_id: &str, algorithm: KeyAlgorithm, public_key: &[u8], status: KeyStatus) -> Self {
        Self {
            key_id: key_id.to_string(),
            algorithm,
            public_key: URL_SAFE_NO_PAD.encode(public_key),
            status,
        }
    }

    /// 解码公钥原始字节
    pub fn public_key_bytes(&self) -> Result<Vec<u8>> {
        URL_SAFE_NO_PAD
            .decode(&self.public_key)
            .map_err(|e| Error::KeyFetch(format!("公钥编码无效 ({}): {}", self.key_id, e)))
    }
}

/// 密钥集发布文档
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySetDocument {
    /// 公钥列表，最新的在前
    pub keys: Vec<PublishedKey>,
}

impl KeySetDocument {
    /// 按密钥 ID 查找
    pub fn find(&self, key_id: &str) -> Option<&PublishedKey> {
        self.keys.iter().find(|k| k.key_id == key_id)
    }
}

/// OIDC 风格的发现文档
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    /// 签发者（信任域 ID）
    pub issuer: String,
    /// 密钥集地址
    pub jwks_uri: String,
}
