//! SVIDNet 验证端
//!
//! 依赖方使用的 JWT-SVID 验证库：按信任域缓存发布端的公钥集，
//! 按固定顺序校验文档，并可把文档交换为 OAuth2 访问令牌。

pub mod allowlist;
pub mod config;
pub mod key_cache;
pub mod key_source;
pub mod token_exchange;
pub mod verifier;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use svidnet_common::{system_clock, Result, SharedClock};

pub use allowlist::TrustDomainAllowlist;
pub use config::{KeyEndpoint, VerifierConfig};
pub use key_cache::KeyCache;
pub use key_source::{FetchedKeySet, HttpKeySource, KeySource};
pub use token_exchange::{AccessToken, TokenExchangeClient};
pub use verifier::{JwtSvidVerifier, VerifiedIdentity, CLOCK_SKEW_SECONDS};

/// 按配置组装的验证端
pub struct SvidVerifier {
    verifier: JwtSvidVerifier,
    allowlist: TrustDomainAllowlist,
    fetch_timeout: Duration,
    refresh_check_interval: Duration,
}

impl SvidVerifier {
    /// 使用 HTTP 公钥源和系统时钟
    pub fn from_config(config: &VerifierConfig) -> Result<Self> {
        let source = Arc::new(HttpKeySource::new(config.endpoints()?, config.fetch_timeout())?);
        Self::with_source(config, source, system_clock())
    }

    /// 使用指定的公钥源和时钟
    pub fn with_source(config: &VerifierConfig, source: Arc<dyn KeySource>, clock: SharedClock) -> Result<Self> {
        config.validate()?;
        let allowlist = config.allowlist()?;
        let cache = Arc::new(KeyCache::new(source, config.default_max_age()));

        info!(trust_domains = allowlist.iter().count(), "验证端初始化完成");
        Ok(Self {
            verifier: JwtSvidVerifier::new(cache, clock),
            allowlist,
            fetch_timeout: config.fetch_timeout(),
            refresh_check_interval: config.refresh_check_interval(),
        })
    }

    pub fn allowlist(&self) -> &TrustDomainAllowlist {
        &self.allowlist
    }

    pub fn cache(&self) -> &Arc<KeyCache> {
        self.verifier.cache()
    }

    /// 以配置的白名单和超时验证文档
    pub async fn verify(&self, token: &str, expected_audience: &str) -> Result<VerifiedIdentity> {
        self.verifier
            .verify(token, expected_audience, &self.allowlist, self.fetch_timeout)
            .await
    }

    /// 预取白名单中所有信任域的公钥集
    pub async fn warm(&self) {
        self.cache().warm(self.allowlist.iter(), self.fetch_timeout).await;
    }

    /// 启动主动刷新任务
    pub fn spawn_refresh_task(&self) -> JoinHandle<()> {
        self.cache()
            .clone()
            .spawn_refresh_task(self.refresh_check_interval, self.fetch_timeout)
    }
}
