//! 签发机构模块
//!
//! 根据已解析的注册条目签发 JWT-SVID。受众必须是条目允许受众的子集，
//! 不会静默收窄；有效期取条目 TTL 与最大 TTL 策略中的较小值。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use svidnet_common::{Error, JwtSvid, Result, SharedClock, SvidClaims, SvidHeader, TrustDomain};

use super::key_manager::KeyManager;
use crate::registry::RegistryEntry;

/// 签发机构
pub struct SigningAuthority {
    trust_domain: TrustDomain,
    max_ttl: Duration,
    keys: Arc<KeyManager>,
    clock: SharedClock,
}

impl SigningAuthority {
    /// 创建签发机构，宽限期不得短于最大 TTL
    pub fn new(
        trust_domain: TrustDomain,
        max_ttl: Duration,
        keys: Arc<KeyManager>,
        clock: SharedClock,
    ) -> Result<Self> {
        if max_ttl.is_zero() {
            return Err(Error::Config("最大 TTL 必须大于 0".to_string()));
        }
        let max_ttl_secs = i64::try_from(max_ttl.as_secs())
            .map_err(|_| Error::Config("最大 TTL 过大".to_string()))?;
        if keys.grace_window().num_seconds() < max_ttl_secs {
            return Err(Error::Config(format!(
                "宽限期 ({}s) 不能短于最大 TTL ({}s)",
                keys.grace_window().num_seconds(),
                max_ttl_secs
            )));
        }

        Ok(Self {
            trust_domain,
            max_ttl,
            keys,
            clock,
        })
    }

    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    pub fn max_ttl(&self) -> Duration {
        self.max_ttl
    }

    /// 密钥管理器
    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// 为条目签发 JWT-SVID
    pub async fn issue(&self, entry: &RegistryEntry, requested_audience: &BTreeSet<String>) -> Result<JwtSvid> {
        if requested_audience.is_empty() || !requested_audience.is_subset(&entry.allowed_audiences) {
            debug!(entry_id = %entry.entry_id, "请求的受众不在允许范围内");
            return Err(Error::AudienceNotAllowed);
        }
        if !entry.spiffe_id.is_member_of(&self.trust_domain) {
            return Err(Error::InternalSigning(format!(
                "条目 {} 的身份不属于信任域 {}",
                entry.entry_id, self.trust_domain
            )));
        }

        let ttl = entry.ttl.min(self.max_ttl).as_secs().max(1);
        let ttl = i64::try_from(ttl).map_err(|_| Error::InternalSigning("TTL 溢出".to_string()))?;
        let iat = self.clock.now().timestamp();

        // 只持有快照，轮换不会影响正在进行的签名
        let ring = self.keys.current().await;
        let key = ring.active();

        let header = SvidHeader::new(key.algorithm(), key.key_id());
        let claims = SvidClaims {
            sub: entry.spiffe_id.clone(),
            aud: requested_audience.clone(),
            exp: iat + ttl,
            iat,
            jti: Uuid::new_v4().to_string(),
            iss: self.trust_domain.id(),
        };

        let signing_input = JwtSvid::signing_input(&header, &claims)
            .map_err(|e| Error::InternalSigning(format!("编码声明失败: {}", e)))?;
        let signature = key.sign(signing_input.as_bytes())?;

        info!(
            spiffe_id = %claims.sub,
            key_id = %header.kid,
            jti = %claims.jti,
            ttl_secs = ttl,
            "签发 JWT-SVID"
        );

        Ok(JwtSvid::assemble(header, claims, &signing_input, signature))
    }
}
