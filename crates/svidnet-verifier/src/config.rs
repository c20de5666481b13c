//! 验证端配置

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

use svidnet_common::{Error, Result, TrustDomain};

use crate::allowlist::TrustDomainAllowlist;

/// 某个信任域的公钥来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEndpoint {
    /// 直接的密钥集地址
    KeysUrl(Url),
    /// 发现文档的基础地址，密钥集地址从 `/.well-known/openid-configuration` 读取
    Discovery(Url),
}

/// 验证端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// 受信任的信任域
    #[serde(default)]
    pub trust_domains: Vec<String>,
    /// 各信任域的公钥来源
    #[serde(default)]
    pub endpoints: BTreeMap<String, KeyEndpoint>,
    /// 单次获取密钥集的超时（毫秒）
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// 主动刷新的检查间隔（秒）
    #[serde(default = "default_refresh_check_interval_seconds")]
    pub refresh_check_interval_seconds: u64,
    /// 发布端未给出缓存时间时使用的默认值（秒）
    #[serde(default = "default_max_age_seconds")]
    pub default_max_age_seconds: u64,
}

fn default_fetch_timeout_ms() -> u64 {
    5000
}

fn default_refresh_check_interval_seconds() -> u64 {
    30
}

fn default_max_age_seconds() -> u64 {
    300
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            trust_domains: Vec::new(),
            endpoints: BTreeMap::new(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            refresh_check_interval_seconds: default_refresh_check_interval_seconds(),
            default_max_age_seconds: default_max_age_seconds(),
        }
    }
}

impl VerifierConfig {
    pub fn allowlist(&self) -> Result<TrustDomainAllowlist> {
        TrustDomainAllowlist::parse(&self.trust_domains)
    }

    /// 解析各信任域的公钥来源
    pub fn endpoints(&self) -> Result<BTreeMap<TrustDomain, KeyEndpoint>> {
        self.endpoints
            .iter()
            .map(|(name, endpoint)| Ok((name.parse::<TrustDomain>()?, endpoint.clone())))
            .collect()
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn refresh_check_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_check_interval_seconds)
    }

    pub fn default_max_age(&self) -> Duration {
        Duration::from_secs(self.default_max_age_seconds)
    }

    /// 校验配置：白名单中的每个信任域都必须配置公钥来源
    pub fn validate(&self) -> Result<()> {
        if self.fetch_timeout_ms == 0 || self.refresh_check_interval_seconds == 0 {
            return Err(Error::Config("超时与刷新间隔必须大于 0".to_string()));
        }
        let endpoints = self.endpoints()?;
        for trust_domain in self.allowlist()?.iter() {
            if !endpoints.contains_key(trust_domain) {
                return Err(Error::Config(format!("信任域 {} 没有配置公钥来源", trust_domain)));
            }
        }
        Ok(())
    }
}
