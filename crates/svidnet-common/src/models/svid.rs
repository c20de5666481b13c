//! JWT-SVID 模型
//!
//! JWT-SVID 使用紧凑 JWS 编码：`base64url(header).base64url(claims).base64url(signature)`。
//! 文档一旦签发即不可变，只能重新签发（新的 `jti`、`iat` 和 `exp`）。

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::models::keys::KeyAlgorithm;
use crate::models::spiffe::SpiffeId;

/// 头部 `typ` 字段
pub const TOKEN_TYPE: &str = "JWT";

/// 可接受的最大令牌长度
const MAX_TOKEN_LEN: usize = 16 * 1024;

/// JWS 头部
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SvidHeader {
    /// 签名算法
    pub alg: KeyAlgorithm,
    /// 签名密钥 ID
    pub kid: String,
    /// 令牌类型
    #[serde(default = "default_typ")]
    pub typ: String,
}

fn default_typ() -> String {
    TOKEN_TYPE.to_string()
}

impl SvidHeader {
    pub fn new(alg: KeyAlgorithm, kid: &str) -> Self {
        Self {
            alg,
            kid: kid.to_string(),
            typ: default_typ(),
        }
    }
}

/// JWT-SVID 声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SvidClaims {
    /// 工作负载身份
    pub sub: SpiffeId,
    /// 受众
    #[serde(with = "audience")]
    pub aud: BTreeSet<String>,
    /// 过期时间（Unix 秒）
    pub exp: i64,
    /// 签发时间（Unix 秒）
    pub iat: i64,
    /// 唯一随机数
    pub jti: String,
    /// 签发者（信任域 ID）
    pub iss: SpiffeId,
}

impl SvidClaims {
    /// 过期时间
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }

    /// 签发时间
    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.iat, 0)
    }
}

/// `aud` 序列化为数组，解析时也接受单个字符串
mod audience {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeSet;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    pub fn serialize<S: Serializer>(aud: &BTreeSet<String>, s: S) -> Result<S::Ok, S::Error> {
        aud.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeSet<String>, D::Error> {
        Ok(match OneOrMany::deserialize(d)? {
            OneOrMany::One(aud) => BTreeSet::from([aud]),
            OneOrMany::Many(auds) => auds.into_iter().collect(),
        })
    }
}

/// 已签名的 JWT-SVID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwtSvid {
    header: SvidHeader,
    claims: SvidClaims,
    signature: Vec<u8>,
    token: String,
}

impl JwtSvid {
    /// 计算签名输入 `base64url(header).base64url(claims)`
    pub fn signing_input(header: &SvidHeader, claims: &SvidClaims) -> Result<String> {
        let header_json = serde_json::to_vec(header)?;
        let claims_json = serde_json::to_vec(claims)?;
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_json),
            URL_SAFE_NO_PAD.encode(claims_json)
        ))
    }

    /// 用签名输入和签名组装完整文档
    pub fn assemble(
        header: SvidHeader,
        claims: SvidClaims,
        signing_input: &str,
        signature: Vec<u8>,
    ) -> Self {
        let token = format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(&signature));
        Self {
            header,
            claims,
            signature,
            token,
        }
    }

    /// 解析紧凑编码的令牌，不做任何签名或声明校验
    pub fn parse(token: &str) -> Result<Self> {
        if token.len() > MAX_TOKEN_LEN {
            return Err(Error::MalformedDocument);
        }
        let mut parts = token.split('.');
        let (header_b64, claims_b64, sig_b64) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(c), Some(s), None) => (h, c, s),
            _ => return Err(Error::MalformedDocument),
        };

        let header: SvidHeader = decode_segment(header_b64)?;
        let claims: SvidClaims = decode_segment(claims_b64)?;
        let signature = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| Error::MalformedDocument)?;
        if signature.is_empty() {
            return Err(Error::MalformedDocument);
        }

        Ok(Self {
            header,
            claims,
            signature,
            token: token.to_string(),
        })
    }

    pub fn header(&self) -> &SvidHeader {
        &self.header
    }

    pub fn claims(&self) -> &SvidClaims {
        &self.claims
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// 被签名的字节（令牌中最后一个 '.' 之前的部分）
    pub fn signed_bytes(&self) -> &[u8] {
        let end = self.token.rfind('.').unwrap_or(0);
        self.token[..end].as_bytes()
    }

    /// 文档所属身份
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.claims.sub
    }

    /// 紧凑编码形式
    pub fn token(&self) -> &str {
        &self.token
    }
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| Error::MalformedDocument)?;
    serde_json::from_slice(&bytes).map_err(|_| Error::MalformedDocument)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_claims() -> SvidClaims {
        SvidClaims {
            sub: SpiffeId::from_uri("spiffe://example.org/mcp-client").unwrap(),
            aud: BTreeSet::from(["https://kc.example.org/realms/spiffe".to_string()]),
            exp: 1_700_000_300,
            iat: 1_700_000_000,
            jti: "5b0e1c1d-0f8e-4c5e-9d7e-2f1f0a0b0c0d".to_string(),
            iss: SpiffeId::from_uri("spiffe://example.org").unwrap(),
        }
    }

    #[test]
    fn test_assemble_then_parse() {
        let header = SvidHeader::new(KeyAlgorithm::Es256, "kid-1");
        let claims = sample_claims();
        let input = JwtSvid::signing_input(&header, &claims).unwrap();
        let svid = JwtSvid::assemble(header.clone(), claims.clone(), &input, vec![1, 2, 3]);

        assert_eq!(svid.token().split('.').count(), 3);

        let parsed = JwtSvid::parse(svid.token()).unwrap();
        assert_eq!(parsed.header(), &header);
        assert_eq!(parsed.claims(), &claims);
        assert_eq!(parsed.signature(), &[1, 2, 3]);
        assert_eq!(parsed.signed_bytes(), input.as_bytes());
    }

    #[test]
    fn test_audience_accepts_single_string() {
        let json = serde_json::json!({
            "sub": "spiffe://example.org/a",
            "aud": "A",
            "exp": 10,
            "iat": 0,
            "jti": "x",
            "iss": "spiffe://example.org",
        });
        let claims: SvidClaims = serde_json::from_value(json).unwrap();
        assert_eq!(claims.aud, BTreeSet::from(["A".to_string()]));

        let out = serde_json::to_value(&claims).unwrap();
        assert_eq!(out["aud"], serde_json::json!(["A"]));
    }

    #[test]
    fn test_malformed_tokens() {
        for token in ["", "a.b", "a.b.c.d", "!!!.e30.AA", "e30.e30.AA"] {
            assert!(
                matches!(JwtSvid::parse(token), Err(Error::MalformedDocument)),
                "{} 应为格式错误",
                token
            );
        }
    }

    #[test]
    fn test_unknown_algorithm_is_malformed() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","kid":"k"}"#);
        let claims = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&sample_claims()).unwrap());
        let token = format!("{}.{}.AAAA", header, claims);
        assert!(matches!(JwtSvid::parse(&token), Err(Error::MalformedDocument)));
    }
}
