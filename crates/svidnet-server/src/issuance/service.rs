//! 身份签发服务
//!
//! 面向工作负载的请求处理层：证明调用方、解析注册条目、调用签发机构。
//! 本层不做重试，也不缓存文档：每次调用都返回一份新签发的文档。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use svidnet_common::{Error, JwtSvid, Result};

use super::attestor::{Attestor, CallerContext};
use crate::authority::SigningAuthority;
use crate::metrics::ServerMetrics;
use crate::registry::IdentityRegistry;

/// 身份签发服务
pub struct IssuanceService {
    attestor: Arc<dyn Attestor>,
    registry: Arc<IdentityRegistry>,
    authority: Arc<SigningAuthority>,
    metrics: Option<Arc<ServerMetrics>>,
}

impl IssuanceService {
    pub fn new(
        attestor: Arc<dyn Attestor>,
        registry: Arc<IdentityRegistry>,
        authority: Arc<SigningAuthority>,
    ) -> Self {
        Self {
            attestor,
            registry,
            authority,
            metrics: None,
        }
    }

    /// 附加指标收集器
    pub fn with_metrics(mut self, metrics: Arc<ServerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 为调用方签发 JWT-SVID
    ///
    /// 超过 `timeout` 返回 [`Error::Timeout`]，与确定性的拒绝区分开。
    pub async fn fetch(
        &self,
        context: &CallerContext,
        requested_audience: &BTreeSet<String>,
        timeout: Duration,
    ) -> Result<JwtSvid> {
        let result = match tokio::time::timeout(timeout, self.fetch_inner(context, requested_audience)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "签发请求超时");
                Err(Error::Timeout)
            }
        };

        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(_) => metrics.record_issued(),
                Err(e) => metrics.record_denied(e.kind()),
            }
        }
        result
    }

    async fn fetch_inner(&self, context: &CallerContext, requested_audience: &BTreeSet<String>) -> Result<JwtSvid> {
        let attestation = self.attestor.attest(context).await?;
        let entry = self
            .registry
            .resolve(&attestation.parent_id, &attestation.attributes)
            .await?;

        debug!(entry_id = %entry.entry_id, "为调用方解析到注册条目");
        self.authority.issue(&entry, requested_audience).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::KeyManager;
    use crate::issuance::attestor::{Attestation, MockAttestor, StaticAttestor};
    use crate::registry::{RegistryEntry, Selector, WorkloadAttributes};
    use svidnet_common::{KeyAlgorithm, ManualClock, SharedClock, SpiffeId, TrustDomain};

    const AUDIENCE: &str = "https://kc.example.org/realms/spiffe";
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn node() -> SpiffeId {
        SpiffeId::from_uri("spiffe://example.org/spire/agent/node-1").unwrap()
    }

    fn authority(clock: SharedClock) -> Arc<SigningAuthority> {
        let keys = Arc::new(KeyManager::new(KeyAlgorithm::Es256, chrono::Duration::hours(1), clock.clone()).unwrap());
        Arc::new(
            SigningAuthority::new(TrustDomain::new("example.org").unwrap(), Duration::from_secs(3600), keys, clock)
                .unwrap(),
        )
    }

    fn entry(selector: &str, spiffe_id: &str) -> RegistryEntry {
        RegistryEntry::new(
            node(),
            vec![selector.parse::<Selector>().unwrap()],
            SpiffeId::from_uri(spiffe_id).unwrap(),
            BTreeSet::from([AUDIENCE.to_string()]),
            Duration::from_secs(300),
        )
        .unwrap()
    }

    async fn build_service(entries: Vec<RegistryEntry>) -> IssuanceService {
        let clock: SharedClock = Arc::new(ManualClock::new(1_700_000_000));
        let attestor = StaticAttestor::new(node(), "caller")
            .bind("mcp-client", WorkloadAttributes::new().with("label", "workload"));
        let registry = Arc::new(IdentityRegistry::with_entries(entries).await.unwrap());
        IssuanceService::new(Arc::new(attestor), registry, authority(clock))
    }

    fn ctx() -> CallerContext {
        CallerContext::default().with_metadata("caller", "mcp-client")
    }

    fn aud(value: &str) -> BTreeSet<String> {
        BTreeSet::from([value.to_string()])
    }

    #[tokio::test]
    async fn test_fetch_issues_document() {
        let service = build_service(vec![entry("label=workload", "spiffe://example.org/mcp-client")]).await;
        let svid = service.fetch(&ctx(), &aud(AUDIENCE), TIMEOUT).await.unwrap();

        assert_eq!(svid.spiffe_id().uri(), "spiffe://example.org/mcp-client");
        assert_eq!(svid.claims().exp, svid.claims().iat + 300);
    }

    #[tokio::test]
    async fn test_fetch_denials() {
        let service = build_service(vec![entry("label=workload", "spiffe://example.org/mcp-client")]).await;
        let result = service.fetch(&ctx(), &aud("https://evil.example.org"), TIMEOUT).await;
        assert!(matches!(result, Err(Error::AudienceNotAllowed)));

        let unknown = CallerContext::default().with_metadata("caller", "intruder");
        let result = service.fetch(&unknown, &aud(AUDIENCE), TIMEOUT).await;
        assert!(matches!(result, Err(Error::NotAttested)));

        let empty = service_with_no_entries().await;
        assert!(matches!(empty.fetch(&ctx(), &aud(AUDIENCE), TIMEOUT).await, Err(Error::NoMatch)));

        let ambiguous = build_service(vec![
            entry("label=workload", "spiffe://example.org/a"),
            entry("label=workload", "spiffe://example.org/b"),
        ])
        .await;
        assert!(matches!(
            ambiguous.fetch(&ctx(), &aud(AUDIENCE), TIMEOUT).await,
            Err(Error::AmbiguousMatch)
        ));
    }

    async fn service_with_no_entries() -> IssuanceService {
        build_service(Vec::new()).await
    }

    #[tokio::test]
    async fn test_every_fetch_is_fresh() {
        let service = build_service(vec![entry("label=workload", "spiffe://example.org/mcp-client")]).await;
        let a = service.fetch(&ctx(), &aud(AUDIENCE), TIMEOUT).await.unwrap();
        let b = service.fetch(&ctx(), &aud(AUDIENCE), TIMEOUT).await.unwrap();
        assert_ne!(a.claims().jti, b.claims().jti);
    }

    #[tokio::test]
    async fn test_attestor_error_surfaces_unchanged() {
        let mut attestor = MockAttestor::new();
        attestor.expect_attest().times(1).returning(|_| Err(Error::NotAttested));

        let clock: SharedClock = Arc::new(ManualClock::new(1_700_000_000));
        let service = IssuanceService::new(Arc::new(attestor), Arc::new(IdentityRegistry::new()), authority(clock));
        let result = service.fetch(&ctx(), &aud(AUDIENCE), TIMEOUT).await;
        assert!(matches!(result, Err(Error::NotAttested)));
    }

    struct SlowAttestor;

    #[async_trait::async_trait]
    impl Attestor for SlowAttestor {
        async fn attest(&self, _context: &CallerContext) -> Result<Attestation> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(Error::NotAttested)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_yields_timeout() {
        let clock: SharedClock = Arc::new(ManualClock::new(1_700_000_000));
        let metrics = Arc::new(ServerMetrics::new().unwrap());
        let service = IssuanceService::new(Arc::new(SlowAttestor), Arc::new(IdentityRegistry::new()), authority(clock))
            .with_metrics(metrics.clone());

        let result = service.fetch(&ctx(), &aud(AUDIENCE), Duration::from_millis(100)).await;
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(err.is_transient());

        let (_, body) = metrics.encode().unwrap();
        assert!(String::from_utf8(body).unwrap().contains("kind=\"timeout\""));
    }

    #[tokio::test]
    async fn test_mock_attestor_drives_resolution() {
        let mut attestor = MockAttestor::new();
        attestor.expect_attest().returning(|_| {
            Ok(Attestation {
                parent_id: SpiffeId::from_uri("spiffe://example.org/spire/agent/node-1").unwrap(),
                attributes: WorkloadAttributes::new().with("label", "workload"),
            })
        });

        let clock: SharedClock = Arc::new(ManualClock::new(1_700_000_000));
        let registry = Arc::new(
            IdentityRegistry::with_entries(vec![entry("label=workload", "spiffe://example.org/mcp-client")])
                .await
                .unwrap(),
        );
        let service = IssuanceService::new(Arc::new(attestor), registry, authority(clock));
        let svid = service.fetch(&CallerContext::default(), &aud(AUDIENCE), TIMEOUT).await.unwrap();
        assert_eq!(svid.spiffe_id().uri(), "spiffe://example.org/mcp-client");
    }
}
