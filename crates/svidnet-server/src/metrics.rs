//! 指标收集与导出模块
//!
//! 该模块统计签发、拒绝、密钥轮换以及密钥集发布请求，
//! 并通过 Prometheus 文本格式在 `/metrics` 导出。

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use svidnet_common::ErrorKind;

/// 签发端指标
pub struct ServerMetrics {
    /// Prometheus 注册表
    registry: Registry,
    /// 成功签发的 SVID 数
    svids_issued_total: IntCounter,
    /// 被拒绝的签发请求，按错误类别区分
    issuance_denied_total: IntCounterVec,
    /// 密钥轮换次数
    key_rotations_total: IntCounter,
    /// 密钥集请求数
    keyset_requests_total: IntCounter,
    /// 被限流的密钥集请求数
    keyset_rate_limited_total: IntCounter,
    /// 当前密钥环版本
    key_ring_version: IntGauge,
}

impl ServerMetrics {
    /// 创建并注册所有指标
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let svids_issued_total = IntCounter::new(
            "svidnet_svids_issued_total",
            "Total number of JWT-SVIDs issued",
        )?;
        let issuance_denied_total = IntCounterVec::new(
            Opts::new(
                "svidnet_issuance_denied_total",
                "Total number of denied issuance requests by kind",
            ),
            &["kind"],
        )?;
        let key_rotations_total = IntCounter::new(
            "svidnet_key_rotations_total",
            "Total number of signing key rotations",
        )?;
        let keyset_requests_total = IntCounter::new(
            "svidnet_keyset_requests_total",
            "Total number of key set requests served",
        )?;
        let keyset_rate_limited_total = IntCounter::new(
            "svidnet_keyset_rate_limited_total",
            "Total number of key set requests rejected by the rate limiter",
        )?;
        let key_ring_version = IntGauge::new(
            "svidnet_key_ring_version",
            "Version of the currently published key ring",
        )?;

        registry.register(Box::new(svids_issued_total.clone()))?;
        registry.register(Box::new(issuance_denied_total.clone()))?;
        registry.register(Box::new(key_rotations_total.clone()))?;
        registry.register(Box::new(keyset_requests_total.clone()))?;
        registry.register(Box::new(keyset_rate_limited_total.clone()))?;
        registry.register(Box::new(key_ring_version.clone()))?;

        Ok(Self {
            registry,
            svids_issued_total,
            issuance_denied_total,
            key_rotations_total,
            keyset_requests_total,
            keyset_rate_limited_total,
            key_ring_version,
        })
    }

    pub fn record_issued(&self) {
        self.svids_issued_total.inc();
    }

    pub fn record_denied(&self, kind: ErrorKind) {
        self.issuance_denied_total.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn record_rotation(&self, version: u64) {
        self.key_rotations_total.inc();
        self.set_key_ring_version(version);
    }

    pub fn set_key_ring_version(&self, version: u64) {
        self.key_ring_version.set(i64::try_from(version).unwrap_or(i64::MAX));
    }

    pub fn record_keyset_request(&self) {
        self.keyset_requests_total.inc();
    }

    pub fn record_rate_limited(&self) {
        self.keyset_rate_limited_total.inc();
    }

    /// 以 Prometheus 文本格式编码，返回 (Content-Type, 内容)
    pub fn encode(&self) -> prometheus::Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }

    /// 获取 Prometheus 注册表
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
