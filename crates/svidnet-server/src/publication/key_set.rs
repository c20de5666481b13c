//! 密钥集发布
//!
//! 从密钥环快照生成对外发布的公钥集合。渲染结果按密钥环版本缓存，
//! 版本号同时作为 HTTP 实体标签，验证方可据此做条件请求。

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use svidnet_common::{DiscoveryDocument, KeySetDocument, Result, TrustDomain};

use crate::authority::KeyManager;

/// 某一版本密钥环的渲染结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedKeySet {
    pub version: u64,
    pub etag: String,
    pub body: Vec<u8>,
}

/// 密钥集发布器
pub struct KeyPublication {
    keys: Arc<KeyManager>,
    trust_domain: TrustDomain,
    jwks_uri: String,
    max_age: Duration,
    rendered: RwLock<Option<Arc<RenderedKeySet>>>,
}

impl KeyPublication {
    /// `public_url` 为验证方访问本服务的基础地址
    pub fn new(keys: Arc<KeyManager>, trust_domain: TrustDomain, public_url: &str, max_age: Duration) -> Self {
        Self {
            keys,
            trust_domain,
            jwks_uri: format!("{}/keys", public_url.trim_end_matches('/')),
            max_age,
            rendered: RwLock::new(None),
        }
    }

    /// 验证方可缓存的最长时间
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// 当前可用于验证的公钥（活动与轮换中），最新的在前
    ///
    /// 没有轮换发生时，重复调用返回相同的结果。
    pub async fn current_keys(&self) -> KeySetDocument {
        KeySetDocument {
            keys: self.keys.current().await.published_keys(),
        }
    }

    /// 发现文档
    pub fn discovery(&self) -> DiscoveryDocument {
        DiscoveryDocument {
            issuer: self.trust_domain.id().uri(),
            jwks_uri: self.jwks_uri.clone(),
        }
    }

    /// 获取当前版本的渲染结果，版本未变时复用缓存
    pub async fn rendered(&self) -> Result<Arc<RenderedKeySet>> {
        let ring = self.keys.current().await;
        if let Some(cached) = self.rendered.read().await.as_ref() {
            if cached.version == ring.version() {
                return Ok(cached.clone());
            }
        }

        let document = KeySetDocument {
            keys: ring.published_keys(),
        };
        let rendered = Arc::new(RenderedKeySet {
            version: ring.version(),
            etag: format!("\"v{}\"", ring.version()),
            body: serde_json::to_vec(&document)?,
        });

        let mut guard = self.rendered.write().await;
        match guard.as_ref() {
            Some(existing) if existing.version >= rendered.version => Ok(existing.clone()),
            _ => {
                debug!(version = rendered.version, keys = document.keys.len(), "重新渲染密钥集");
                *guard = Some(rendered.clone());
                Ok(rendered)
            }
        }
    }
}
