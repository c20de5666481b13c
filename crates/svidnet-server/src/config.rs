//! 配置管理模块
//!
//! 负责加载签发服务的配置文件，支持 YAML/JSON 格式，
//! 并允许通过 `SVIDNET__` 前缀的环境变量覆盖单个配置项。

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use svidnet_common::{KeyAlgorithm, SpiffeId, TrustDomain};

use crate::registry::{RegistryEntry, Selector};

/// 签发服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 信任域
    pub trust_domain: String,
    /// 本节点（证明方）的 SPIFFE ID
    pub node_id: String,
    /// 签名算法：ES256 或 EdDSA
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// 条目未指定时的默认 TTL（秒）
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: u64,
    /// 最大 TTL 策略（秒）
    #[serde(default = "default_max_ttl_seconds")]
    pub max_ttl_seconds: u64,
    /// 密钥轮换间隔（秒）
    #[serde(default = "default_rotation_interval_seconds")]
    pub rotation_interval_seconds: u64,
    /// 轮换后旧密钥保留的宽限期（秒），默认等于最大 TTL
    #[serde(default)]
    pub grace_window_seconds: Option<u64>,
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// 公钥发布配置
    #[serde(default)]
    pub publication: PublicationConfig,
    /// 工作负载接口配置
    #[serde(default)]
    pub workload: WorkloadConfig,
    /// 初始注册条目
    #[serde(default)]
    pub entries: Vec<EntryConfig>,
}

/// 公钥发布配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicationConfig {
    /// 监听地址
    pub listen_address: String,
    /// 验证方访问本服务的基础地址，默认 `http://<listen_address>`
    #[serde(default)]
    pub public_url: Option<String>,
    /// 建议的缓存时间（秒）
    pub max_age_seconds: u64,
    /// 限流配置
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Default for PublicationConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8443".to_string(),
            public_url: None,
            max_age_seconds: 300,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// 限流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 每秒请求数
    pub requests_per_second: u32,
    /// 突发上限
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 50,
            burst: 100,
        }
    }
}

/// 工作负载接口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Unix 域套接字路径
    pub socket_path: PathBuf,
    /// 单次签发的超时（毫秒）
    pub timeout_ms: u64,
    /// 请求未指定受众时使用的默认受众
    #[serde(default)]
    pub default_audience: Vec<String>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/svidnet/agent.sock"),
            timeout_ms: 5000,
            default_audience: Vec::new(),
        }
    }
}

/// 配置文件中的注册条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    #[serde(default)]
    pub entry_id: Option<String>,
    /// 父身份，默认为本节点
    #[serde(default)]
    pub parent_id: Option<String>,
    /// 选择器，形如 `k=v`、`k^=prefix`、`k in a,b`
    pub selectors: Vec<String>,
    pub spiffe_id: String,
    pub allowed_audiences: Vec<String>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

fn default_algorithm() -> String {
    "ES256".to_string()
}

fn default_ttl_seconds() -> u64 {
    300
}

fn default_max_ttl_seconds() -> u64 {
    3600
}

fn default_rotation_interval_seconds() -> u64 {
    86_400
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServerConfig {
    /// 从文件加载配置，格式由扩展名决定
    pub fn load(config_path: &Path) -> Result<Self> {
        let format = match config_path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            _ => return Err(anyhow!("不支持的配置文件格式，仅支持 YAML 或 JSON")),
        };

        let config = Config::builder()
            .add_source(File::from(config_path).format(format))
            .add_source(Environment::with_prefix("SVIDNET").separator("__"))
            .build()
            .context("构建配置失败")?;

        let server_config = config
            .try_deserialize::<ServerConfig>()
            .context("配置格式错误")?;
        server_config.validate()?;
        Ok(server_config)
    }

    /// 校验配置的一致性
    pub fn validate(&self) -> Result<()> {
        let trust_domain = self.trust_domain()?;
        let node_id = self.node_id()?;
        if !node_id.is_member_of(&trust_domain) {
            return Err(anyhow!("节点 ID {} 不属于信任域 {}", node_id, trust_domain));
        }
        self.algorithm()?;

        if self.max_ttl_seconds == 0 || self.default_ttl_seconds == 0 {
            return Err(anyhow!("TTL 必须大于 0"));
        }
        if self.rotation_interval_seconds == 0 {
            return Err(anyhow!("轮换间隔必须大于 0"));
        }
        if self.grace_window().as_secs() < self.max_ttl_seconds {
            return Err(anyhow!(
                "宽限期 ({}s) 不能短于最大 TTL ({}s)",
                self.grace_window().as_secs(),
                self.max_ttl_seconds
            ));
        }
        self.listen_address()?;
        self.registry_entries()?;
        Ok(())
    }

    pub fn trust_domain(&self) -> Result<TrustDomain> {
        Ok(self.trust_domain.parse::<TrustDomain>()?)
    }

    pub fn node_id(&self) -> Result<SpiffeId> {
        Ok(SpiffeId::from_uri(&self.node_id)?)
    }

    pub fn algorithm(&self) -> Result<KeyAlgorithm> {
        Ok(self.algorithm.parse::<KeyAlgorithm>()?)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_seconds)
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_seconds)
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_secs(self.grace_window_seconds.unwrap_or(self.max_ttl_seconds))
    }

    pub fn listen_address(&self) -> Result<SocketAddr> {
        self.publication
            .listen_address
            .parse()
            .with_context(|| format!("监听地址无效: {}", self.publication.listen_address))
    }

    /// 发布服务的对外地址
    pub fn public_url(&self) -> String {
        self.publication
            .public_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.publication.listen_address))
    }

    pub fn issuance_timeout(&self) -> Duration {
        Duration::from_millis(self.workload.timeout_ms)
    }

    pub fn default_audience(&self) -> BTreeSet<String> {
        self.workload.default_audience.iter().cloned().collect()
    }

    /// 把配置中的条目转换为注册条目
    pub fn registry_entries(&self) -> Result<Vec<RegistryEntry>> {
        let node_id = self.node_id()?;
        self.entries
            .iter()
            .map(|entry| entry.to_registry_entry(&node_id, self.default_ttl_seconds))
            .collect()
    }
}

impl EntryConfig {
    fn to_registry_entry(&self, node_id: &SpiffeId, default_ttl_seconds: u64) -> Result<RegistryEntry> {
        let parent_id = match &self.parent_id {
            Some(parent) => SpiffeId::from_uri(parent)?,
            None => node_id.clone(),
        };
        let selectors = self
            .selectors
            .iter()
            .map(|s| s.parse::<Selector>())
            .collect::<svidnet_common::Result<Vec<_>>>()?;
        let spiffe_id = SpiffeId::from_uri(&self.spiffe_id)?;
        let ttl = Duration::from_secs(self.ttl_seconds.unwrap_or(default_ttl_seconds));

        let entry = RegistryEntry::new(
            parent_id,
            selectors,
            spiffe_id,
            self.allowed_audiences.iter().cloned().collect(),
            ttl,
        )
        .with_context(|| format!("注册条目无效: {}", self.spiffe_id))?;

        Ok(match &self.entry_id {
            Some(id) => entry.with_entry_id(id),
            None => entry,
        })
    }
}
