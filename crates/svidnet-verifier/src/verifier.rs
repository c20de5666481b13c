//! JWT-SVID 验证
//!
//! 检查按固定顺序进行，第一个失败即返回：
//!
//! 1. 解码文档；签发者所在信任域必须在白名单中
//! 2. 按 `kid` 解析公钥，缓存中没有时强制刷新一次
//! 3. 校验签名
//! 4. 检查过期时间（允许 30 秒时钟偏差）
//! 5. 检查期望受众是否在 `aud` 中（精确匹配）

use ring::signature::{UnparsedPublicKey, VerificationAlgorithm, ECDSA_P256_SHA256_FIXED, ED25519};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use svidnet_common::{
    Error, JwtSvid, KeyAlgorithm, KeyStatus, PublishedKey, Result, SharedClock, SpiffeId, SvidClaims,
};

use crate::allowlist::TrustDomainAllowlist;
use crate::key_cache::KeyCache;

/// 允许的时钟偏差（秒）
pub const CLOCK_SKEW_SECONDS: i64 = 30;

/// 验证通过的身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub identity: SpiffeId,
    pub claims: SvidClaims,
}

/// JWT-SVID 验证器
pub struct JwtSvidVerifier {
    cache: Arc<KeyCache>,
    clock: SharedClock,
}

impl JwtSvidVerifier {
    pub fn new(cache: Arc<KeyCache>, clock: SharedClock) -> Self {
        Self { cache, clock }
    }

    pub fn cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    /// 验证文档
    ///
    /// `timeout` 只作用于可能发生的公钥获取。
    pub async fn verify(
        &self,
        token: &str,
        expected_audience: &str,
        allowlist: &TrustDomainAllowlist,
        timeout: Duration,
    ) -> Result<VerifiedIdentity> {
        let svid = JwtSvid::parse(token)?;
        let claims = svid.claims();

        let issuer = claims.iss.trust_domain();
        if !claims.iss.is_trust_domain_id() || !allowlist.contains(issuer) {
            debug!(issuer = %claims.iss, "签发者不在白名单中");
            return Err(Error::UntrustedIssuer);
        }
        if !claims.sub.is_member_of(issuer) {
            debug!(issuer = %claims.iss, subject = %claims.sub, "身份不属于签发者的信任域");
            return Err(Error::UntrustedIssuer);
        }

        let key_id = &svid.header().kid;
        let key = self.cache.resolve_key(issuer, key_id, timeout).await?;
        verify_signature(&svid, &key)?;

        // 签名校验期间可能已获取到把该密钥标记为吊销的新集合
        if self.cache.status_of(issuer, key_id).await == Some(KeyStatus::Revoked) {
            warn!(key_id = %key_id, "签名密钥已被吊销");
            return Err(Error::UnknownKey);
        }

        if self.clock.now().timestamp() >= claims.exp.saturating_add(CLOCK_SKEW_SECONDS) {
            return Err(Error::Expired);
        }

        if !claims.aud.contains(expected_audience) {
            return Err(Error::AudienceMismatch);
        }

        debug!(subject = %claims.sub, key_id = %key_id, "JWT-SVID 验证通过");
        Ok(VerifiedIdentity {
            identity: claims.sub.clone(),
            claims: claims.clone(),
        })
    }
}

fn verify_signature(svid: &JwtSvid, key: &PublishedKey) -> Result<()> {
    if svid.header().alg != key.algorithm {
        return Err(Error::SignatureInvalid);
    }
    let algorithm: &'static dyn VerificationAlgorithm = match key.algorithm {
        KeyAlgorithm::Es256 => &ECDSA_P256_SHA256_FIXED,
        KeyAlgorithm::EdDsa => &ED25519,
    };
    let public_key = key.public_key_bytes().map_err(|_| Error::SignatureInvalid)?;

    UnparsedPublicKey::new(algorithm, public_key)
        .verify(svid.signed_bytes(), svid.signature())
        .map_err(|_| Error::SignatureInvalid)
}
