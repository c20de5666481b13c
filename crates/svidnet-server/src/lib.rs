//! SVIDNet 签发端
//!
//! 该 crate 实现 JWT-SVID 的签发侧：身份注册表、签发机构（含密钥轮换）、
//! 面向工作负载的签发服务以及公钥发布端点。

pub mod authority;
pub mod config;
pub mod issuance;
pub mod metrics;
pub mod publication;
pub mod registry;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use svidnet_common::{system_clock, SharedClock};

use crate::authority::{KeyManager, SigningAuthority};
use crate::config::ServerConfig;
use crate::issuance::{IssuanceService, UnixPeerAttestor};
use crate::metrics::ServerMetrics;
use crate::publication::{KeyPublication, PublicationServer, TokenBucket};
use crate::registry::IdentityRegistry;

/// 清理过期轮换密钥的最长检查间隔
const MAX_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// 签发端主结构体
pub struct SvidServer {
    config: ServerConfig,
    registry: Arc<IdentityRegistry>,
    authority: Arc<SigningAuthority>,
    issuance: Arc<IssuanceService>,
    publication: Arc<KeyPublication>,
    metrics: Arc<ServerMetrics>,
}

impl SvidServer {
    /// 使用系统时钟创建签发端
    pub async fn new(config: ServerConfig) -> Result<Self> {
        Self::with_clock(config, system_clock()).await
    }

    /// 使用指定时钟创建签发端
    pub async fn with_clock(config: ServerConfig, clock: SharedClock) -> Result<Self> {
        config.validate()?;
        let trust_domain = config.trust_domain()?;
        let grace_window = chrono::Duration::from_std(config.grace_window()).context("宽限期过大")?;

        let metrics = Arc::new(ServerMetrics::new().context("注册指标失败")?);
        let registry = Arc::new(IdentityRegistry::with_entries(config.registry_entries()?).await?);
        let keys = Arc::new(KeyManager::new(config.algorithm()?, grace_window, clock.clone())?);
        metrics.set_key_ring_version(keys.current().await.version());

        let authority = Arc::new(SigningAuthority::new(
            trust_domain.clone(),
            config.max_ttl(),
            keys.clone(),
            clock,
        )?);

        let attestor = Arc::new(UnixPeerAttestor::new(config.node_id()?));
        let issuance = Arc::new(
            IssuanceService::new(attestor, registry.clone(), authority.clone()).with_metrics(metrics.clone()),
        );

        let publication = Arc::new(KeyPublication::new(
            keys,
            trust_domain,
            &config.public_url(),
            Duration::from_secs(config.publication.max_age_seconds),
        ));

        info!(
            trust_domain = %config.trust_domain,
            entries = config.entries.len(),
            "签发端初始化完成"
        );

        Ok(Self {
            config,
            registry,
            authority,
            issuance,
            publication,
            metrics,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    pub fn authority(&self) -> &Arc<SigningAuthority> {
        &self.authority
    }

    pub fn issuance(&self) -> &Arc<IssuanceService> {
        &self.issuance
    }

    pub fn publication(&self) -> &Arc<KeyPublication> {
        &self.publication
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    /// 构造公钥发布 HTTP 服务
    pub fn publication_server(&self) -> Arc<PublicationServer> {
        let rate_limit = &self.config.publication.rate_limit;
        Arc::new(PublicationServer::new(
            self.publication.clone(),
            TokenBucket::new(rate_limit.requests_per_second, rate_limit.burst),
            self.metrics.clone(),
        ))
    }

    /// 启动密钥轮换任务
    pub fn spawn_rotation_task(&self) -> JoinHandle<()> {
        let keys = self.authority.keys().clone();
        let metrics = self.metrics.clone();
        let rotation_interval = self.config.rotation_interval();
        let prune_interval = rotation_interval.min(self.config.grace_window()).min(MAX_PRUNE_INTERVAL);

        tokio::spawn(async move {
            let mut rotate_tick = tokio::time::interval_at(tokio::time::Instant::now() + rotation_interval, rotation_interval);
            let mut prune_tick = tokio::time::interval(prune_interval);

            loop {
                tokio::select! {
                    _ = rotate_tick.tick() => {
                        match keys.rotate().await {
                            Ok(ring) => metrics.record_rotation(ring.version()),
                            Err(e) => error!("密钥轮换失败: {}", e),
                        }
                    }
                    _ = prune_tick.tick() => {
                        if keys.prune().await > 0 {
                            metrics.set_key_ring_version(keys.current().await.version());
                        }
                    }
                }
            }
        })
    }

    /// 启动全部后台任务与服务
    pub async fn start(&self) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = vec![self.spawn_rotation_task()];

        let addr = self.config.listen_address()?;
        let server = self.publication_server();
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.serve(addr).await {
                error!("密钥发布服务错误: {}", e);
            }
        }));

        #[cfg(unix)]
        {
            use crate::issuance::WorkloadSocketServer;

            let listener = WorkloadSocketServer::bind(&self.config.workload.socket_path)
                .with_context(|| format!("无法绑定工作负载套接字: {:?}", self.config.workload.socket_path))?;
            let socket = Arc::new(WorkloadSocketServer::new(
                self.issuance.clone(),
                self.config.default_audience(),
                self.config.issuance_timeout(),
            ));
            handles.push(tokio::spawn(async move {
                if let Err(e) = socket.serve(listener).await {
                    error!("工作负载套接字错误: {}", e);
                }
            }));
        }
        #[cfg(not(unix))]
        tracing::warn!("当前平台不支持工作负载套接字");

        info!("签发端已启动");
        Ok(handles)
    }
}
