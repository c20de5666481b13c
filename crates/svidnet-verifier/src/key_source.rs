//! 公钥集来源
//!
//! [`KeySource`] 从发布端获取某个信任域的公钥集。HTTP 实现支持直接的密钥集
//! 地址和发现文档两种配置方式，并读取 `Cache-Control: max-age` 作为缓存时间。

use async_trait::async_trait;
use reqwest::header::CACHE_CONTROL;
use reqwest::Client;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use svidnet_common::{DiscoveryDocument, Error, KeySetDocument, Result, TrustDomain};

use crate::config::KeyEndpoint;

/// 发现文档的固定路径
pub const DISCOVERY_PATH: &str = ".well-known/openid-configuration";

/// 一次获取的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedKeySet {
    pub document: KeySetDocument,
    /// 发布端给出的缓存时间
    pub max_age: Option<Duration>,
}

/// 公钥集来源
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn fetch(&self, trust_domain: &TrustDomain) -> Result<FetchedKeySet>;
}

/// 基于 HTTP 的公钥集来源
pub struct HttpKeySource {
    client: Client,
    endpoints: BTreeMap<TrustDomain, KeyEndpoint>,
    discovered: RwLock<HashMap<TrustDomain, Url>>,
}

impl HttpKeySource {
    pub fn new(endpoints: BTreeMap<TrustDomain, KeyEndpoint>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self {
            client,
            endpoints,
            discovered: RwLock::new(HashMap::new()),
        })
    }

    async fn keys_url(&self, trust_domain: &TrustDomain) -> Result<Url> {
        match self.endpoints.get(trust_domain) {
            Some(KeyEndpoint::KeysUrl(url)) => Ok(url.clone()),
            Some(KeyEndpoint::Discovery(base)) => {
                if let Some(url) = self.discovered.read().await.get(trust_domain) {
                    return Ok(url.clone());
                }
                let url = self.discover(trust_domain, base).await?;
                self.discovered.write().await.insert(trust_domain.clone(), url.clone());
                Ok(url)
            }
            None => Err(Error::KeyFetch(format!("信任域 {} 没有配置公钥来源", trust_domain))),
        }
    }

    async fn discover(&self, trust_domain: &TrustDomain, base: &Url) -> Result<Url> {
        let mut base = base.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let discovery_url = base
            .join(DISCOVERY_PATH)
            .map_err(|e| Error::KeyFetch(format!("发现地址无效: {}", e)))?;

        let response = self.client.get(discovery_url.clone()).send().await.map_err(map_reqwest)?;
        if !response.status().is_success() {
            return Err(Error::KeyFetch(format!("发现文档请求失败: HTTP {}", response.status())));
        }
        let document: DiscoveryDocument = response.json().await.map_err(map_reqwest)?;

        if document.issuer != trust_domain.id().uri() {
            return Err(Error::KeyFetch(format!(
                "发现文档的签发者 {} 与信任域 {} 不符",
                document.issuer, trust_domain
            )));
        }
        let keys_url = Url::parse(&document.jwks_uri)
            .map_err(|e| Error::KeyFetch(format!("密钥集地址无效: {}", e)))?;
        info!(trust_domain = %trust_domain, keys_url = %keys_url, "通过发现文档定位密钥集");
        Ok(keys_url)
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch(&self, trust_domain: &TrustDomain) -> Result<FetchedKeySet> {
        let url = self.keys_url(trust_domain).await?;
        let response = self.client.get(url).send().await.map_err(map_reqwest)?;

        if !response.status().is_success() {
            return Err(Error::KeyFetch(format!("密钥集请求失败: HTTP {}", response.status())));
        }
        let max_age = response
            .headers()
            .get(CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_max_age);
        let document: KeySetDocument = response.json().await.map_err(map_reqwest)?;

        debug!(trust_domain = %trust_domain, keys = document.keys.len(), "获取密钥集成功");
        Ok(FetchedKeySet { document, max_age })
    }
}

fn map_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else {
        Error::KeyFetch(e.to_string())
    }
}

/// 解析 `Cache-Control` 中的 `max-age`，带 `no-store`/`no-cache` 时视为 0
pub fn parse_max_age(header: &str) -> Option<Duration> {
    let mut max_age = None;
    for directive in header.split(',').map(str::trim) {
        let lower = directive.to_ascii_lowercase();
        if lower == "no-store" || lower == "no-cache" {
            return Some(Duration::ZERO);
        }
        if let Some(value) = lower.strip_prefix("max-age=") {
            max_age = value.trim_matches('"').parse::<u64>().ok().map(Duration::from_secs);
        }
    }
    max_age
}
