//! SPIFFE ID 模型
//!
//! 该模块实现了符合 SPIFFE 标准的身份标识符。SPIFFE ID 由信任域和
//! 有序的路径段组成，格式为 `spiffe://trust-domain/seg1/seg2`。
//! 身份本身只是标识符，没有独立的生命周期。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

const SCHEME_PREFIX: &str = "spiffe://";

/// 信任域最大长度
const MAX_TRUST_DOMAIN_LEN: usize = 255;

/// 信任域（如 example.org）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrustDomain(String);

impl TrustDomain {
    /// 创建新的信任域，仅允许小写字母、数字以及 `.`、`-`、`_`
    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::InvalidSpiffeId("信任域不能为空".to_string()));
        }
        if name.len() > MAX_TRUST_DOMAIN_LEN {
            return Err(Error::InvalidSpiffeId("信任域过长".to_string()));
        }
        let valid = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'));
        if !valid {
            return Err(Error::InvalidSpiffeId(format!("信任域包含非法字符: {}", name)));
        }

        Ok(Self(name.to_string()))
    }

    /// 信任域名称
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 信任域自身的 SPIFFE ID（`spiffe://example.org`），用作签发者标识
    pub fn id(&self) -> SpiffeId {
        SpiffeId {
            trust_domain: self.clone(),
            segments: Vec::new(),
        }
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TrustDomain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // 同时接受裸域名和 spiffe://example.org 形式
        match s.strip_prefix(SCHEME_PREFIX) {
            Some(rest) => Self::new(rest),
            None => Self::new(s),
        }
    }
}

impl Serialize for TrustDomain {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TrustDomain {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// SPIFFE ID 结构体
///
/// 符合 SPIFFE 标准的身份标识符，格式为：
/// spiffe://trust-domain/path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpiffeId {
    /// 信任域
    trust_domain: TrustDomain,
    /// 有序路径段
    segments: Vec<String>,
}

impl SpiffeId {
    /// 由信任域和路径创建 SPIFFE ID，路径必须以 '/' 开头
    pub fn new(trust_domain: &str, path: &str) -> Result<Self> {
        let trust_domain = TrustDomain::new(trust_domain)?;
        let segments = parse_path(path)?;
        Ok(Self {
            trust_domain,
            segments,
        })
    }

    /// 从 URI 字符串解析 SPIFFE ID
    pub fn from_uri(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix(SCHEME_PREFIX)
            .ok_or_else(|| Error::InvalidSpiffeId(format!("无效的 SPIFFE URI scheme: {}", uri)))?;

        let (domain, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };

        if domain.is_empty() {
            return Err(Error::InvalidSpiffeId("缺少信任域".to_string()));
        }
        // 端口、用户信息、查询和片段都不允许出现
        if domain.contains(':') || domain.contains('@') || rest.contains('?') || rest.contains('#') {
            return Err(Error::InvalidSpiffeId(format!("SPIFFE URI 含有非法部分: {}", uri)));
        }

        Self::new(domain, path)
    }

    /// 信任域
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// 路径段
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// 路径部分（如 /service/database），信任域 ID 的路径为空字符串
    pub fn path(&self) -> String {
        self.segments.iter().map(|s| format!("/{}", s)).collect()
    }

    /// 是否为信任域自身的 ID
    pub fn is_trust_domain_id(&self) -> bool {
        self.segments.is_empty()
    }

    /// 是否属于给定的信任域
    pub fn is_member_of(&self, trust_domain: &TrustDomain) -> bool {
        &self.trust_domain == trust_domain
    }

    /// 生成 SPIFFE URI 字符串
    pub fn uri(&self) -> String {
        format!("{}{}{}", SCHEME_PREFIX, self.trust_domain, self.path())
    }
}

fn parse_path(path: &str) -> Result<Vec<String>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| Error::InvalidSpiffeId("路径必须以 '/' 开头".to_string()))?;

    rest.split('/')
        .map(|segment| {
            if segment.is_empty() {
                return Err(Error::InvalidSpiffeId("路径段不能为空".to_string()));
            }
            if segment == "." || segment == ".." {
                return Err(Error::InvalidSpiffeId("路径段不能为 '.' 或 '..'".to_string()));
            }
            let valid = segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
            if !valid {
                return Err(Error::InvalidSpiffeId(format!("路径段包含非法字符: {}", segment)));
            }
            Ok(segment.to_string())
        })
        .collect()
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri())
    }
}

impl FromStr for SpiffeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_uri(s)
    }
}

impl Serialize for SpiffeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.uri())
    }
}

impl<'de> Deserialize<'de> for SpiffeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_uri(&s).map_err(serde::de::Error::custom)
    }
}
