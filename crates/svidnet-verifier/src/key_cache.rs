//! 公钥缓存
//!
//! 按信任域缓存发布端的公钥集。每个信任域同一时刻最多只有一个进行中的获取，
//! 并发的刷新请求在同一把锁上排队。每次获取开始时分配一个序号，
//! 排队者只复用在自己发起请求之后才开始的获取结果。
//!
//! 获取失败时保留旧的公钥集，旧公钥在获取到更新的集合之前仍然可用。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use svidnet_common::{Error, KeySetDocument, KeyStatus, PublishedKey, Result, TrustDomain};

use crate::key_source::KeySource;

struct CachedKeySet {
    document: KeySetDocument,
    fetched_at: Instant,
    max_age: Duration,
}

impl CachedKeySet {
    fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= self.max_age
    }
}

#[derive(Default)]
struct DomainSlot {
    keys: RwLock<Option<Arc<CachedKeySet>>>,
    refresh_lock: Mutex<()>,
    /// 已开始的获取次数，只在持有 `refresh_lock` 时递增
    started: AtomicU64,
    /// 最近一次成功获取的序号
    completed: AtomicU64,
}

/// 公钥缓存
pub struct KeyCache {
    source: Arc<dyn KeySource>,
    default_max_age: Duration,
    slots: RwLock<HashMap<TrustDomain, Arc<DomainSlot>>>,
}

impl KeyCache {
    /// `default_max_age` 用于发布端未给出缓存时间的情况
    pub fn new(source: Arc<dyn KeySource>, default_max_age: Duration) -> Self {
        Self {
            source,
            default_max_age,
            slots: RwLock::new(HashMap::new()),
        }
    }

    async fn slot(&self, trust_domain: &TrustDomain) -> Arc<DomainSlot> {
        if let Some(slot) = self.slots.read().await.get(trust_domain) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(trust_domain.clone())
            .or_default()
            .clone()
    }

    async fn snapshot(&self, trust_domain: &TrustDomain) -> Option<Arc<CachedKeySet>> {
        let slot = self.slots.read().await.get(trust_domain).cloned()?;
        let keys = slot.keys.read().await;
        keys.clone()
    }

    /// 当前缓存的公钥集
    pub async fn cached(&self, trust_domain: &TrustDomain) -> Option<KeySetDocument> {
        self.snapshot(trust_domain).await.map(|set| set.document.clone())
    }

    /// 在缓存中查找可用于验证的公钥，已吊销的视为不存在
    pub async fn lookup(&self, trust_domain: &TrustDomain, key_id: &str) -> Option<PublishedKey> {
        let set = self.snapshot(trust_domain).await?;
        set.document
            .find(key_id)
            .filter(|key| key.status.is_usable())
            .cloned()
    }

    /// 缓存中记录的公钥状态
    pub async fn status_of(&self, trust_domain: &TrustDomain, key_id: &str) -> Option<KeyStatus> {
        let set = self.snapshot(trust_domain).await?;
        set.document.find(key_id).map(|key| key.status)
    }

    /// 刷新某个信任域的公钥集
    ///
    /// 只复用调用之后才开始的获取，进行中的旧获取完成后会再获取一次。
    /// 超过 `timeout` 返回 [`Error::Timeout`]，失败时保留原有的公钥集。
    pub async fn refresh(&self, trust_domain: &TrustDomain, timeout: Duration) -> Result<()> {
        let slot = self.slot(trust_domain).await;
        let since = slot.started.load(Ordering::Acquire);
        self.refresh_from(trust_domain, &slot, since + 1, timeout).await
    }

    /// 持锁后若序号不小于 `min_seq` 的获取已经成功则直接复用，否则自己获取
    async fn refresh_from(
        &self,
        trust_domain: &TrustDomain,
        slot: &DomainSlot,
        min_seq: u64,
        timeout: Duration,
    ) -> Result<()> {
        let _guard = slot.refresh_lock.lock().await;
        if slot.completed.load(Ordering::Acquire) >= min_seq {
            debug!(trust_domain = %trust_domain, "其他任务已完成刷新");
            return Ok(());
        }

        let seq = slot.started.fetch_add(1, Ordering::AcqRel) + 1;
        let fetched = match tokio::time::timeout(timeout, self.source.fetch(trust_domain)).await {
            Ok(Ok(fetched)) => fetched,
            Ok(Err(e)) => {
                warn!(trust_domain = %trust_domain, "获取密钥集失败，保留旧的密钥集: {}", e);
                return Err(e);
            }
            Err(_) => {
                warn!(trust_domain = %trust_domain, "获取密钥集超时，保留旧的密钥集");
                return Err(Error::Timeout);
            }
        };

        let max_age = fetched.max_age.unwrap_or(self.default_max_age);
        debug!(
            trust_domain = %trust_domain,
            seq,
            keys = fetched.document.keys.len(),
            max_age_secs = max_age.as_secs(),
            "更新密钥集缓存"
        );
        *slot.keys.write().await = Some(Arc::new(CachedKeySet {
            document: fetched.document,
            fetched_at: Instant::now(),
            max_age,
        }));
        slot.completed.store(seq, Ordering::Release);
        Ok(())
    }

    /// 解析验证用的公钥，缓存中没有时强制刷新一次
    ///
    /// 先等待未命中时已在进行的获取，其结果里有该密钥就直接使用；
    /// 否则必须有一次在未命中之后才开始的获取，才能判定为未知密钥。
    pub async fn resolve_key(&self, trust_domain: &TrustDomain, key_id: &str, timeout: Duration) -> Result<PublishedKey> {
        if let Some(key) = self.lookup(trust_domain, key_id).await {
            return Ok(key);
        }

        let slot = self.slot(trust_domain).await;
        let since = slot.started.load(Ordering::Acquire);
        self.refresh_from(trust_domain, &slot, since, timeout).await?;
        if let Some(key) = self.lookup(trust_domain, key_id).await {
            return Ok(key);
        }
        if slot.completed.load(Ordering::Acquire) > since {
            return Err(Error::UnknownKey);
        }

        debug!(trust_domain = %trust_domain, key_id = %key_id, "缓存中没有该密钥，强制刷新");
        self.refresh_from(trust_domain, &slot, since + 1, timeout).await?;
        self.lookup(trust_domain, key_id).await.ok_or(Error::UnknownKey)
    }

    /// 预先获取一组信任域的公钥集，失败只记录日志
    pub async fn warm<'a, I>(&self, trust_domains: I, timeout: Duration)
    where
        I: IntoIterator<Item = &'a TrustDomain>,
    {
        for trust_domain in trust_domains {
            if let Err(e) = self.refresh(trust_domain, timeout).await {
                warn!(trust_domain = %trust_domain, "预取密钥集失败: {}", e);
            }
        }
    }

    /// 刷新所有已过缓存时间或尚未成功获取的信任域，返回成功刷新的数量
    pub async fn refresh_stale(&self, timeout: Duration) -> usize {
        let slots: Vec<(TrustDomain, Arc<DomainSlot>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(td, slot)| (td.clone(), slot.clone()))
            .collect();

        let mut refreshed = 0;
        for (trust_domain, slot) in slots {
            let stale = match slot.keys.read().await.as_ref() {
                Some(set) => set.is_stale(),
                None => true,
            };
            if stale && self.refresh(&trust_domain, timeout).await.is_ok() {
                refreshed += 1;
            }
        }
        refreshed
    }

    /// 启动主动刷新任务
    pub fn spawn_refresh_task(self: Arc<Self>, check_interval: Duration, timeout: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);
            loop {
                interval.tick().await;
                let refreshed = self.refresh_stale(timeout).await;
                if refreshed > 0 {
                    info!(refreshed, "主动刷新密钥集");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_source::{FetchedKeySet, MockKeySource};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use svidnet_common::KeyAlgorithm;

    fn domain() -> TrustDomain {
        TrustDomain::new("example.org").unwrap()
    }

    fn key(key_id: &str, status: KeyStatus) -> PublishedKey {
        PublishedKey::new(key_id, KeyAlgorithm::EdDsa, &[7u8; 32], status)
    }

    fn fetched(keys: Vec<PublishedKey>, max_age: Option<u64>) -> FetchedKeySet {
        FetchedKeySet {
            document: KeySetDocument { keys },
            max_age: max_age.map(Duration::from_secs),
        }
    }

    struct CountingSource {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl KeySource for CountingSource {
        async fn fetch(&self, _trust_domain: &TrustDomain) -> Result<FetchedKeySet> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(fetched(vec![key("k1", KeyStatus::Active)], Some(60)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refresh_deduplicated() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(200),
        });
        let cache = Arc::new(KeyCache::new(source.clone(), Duration::from_secs(300)));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.resolve_key(&domain(), "k1", Duration::from_secs(5)).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().key_id, "k1");
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_key_after_single_refresh() {
        let mut source = MockKeySource::new();
        source
            .expect_fetch()
            .times(1)
            .returning(|_| Ok(fetched(vec![key("k1", KeyStatus::Active)], None)));
        let cache = KeyCache::new(Arc::new(source), Duration::from_secs(300));

        let result = cache.resolve_key(&domain(), "missing", Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::UnknownKey)));
    }

    #[tokio::test]
    async fn test_revoked_key_treated_as_absent() {
        let mut source = MockKeySource::new();
        source.expect_fetch().times(2).returning(|_| {
            Ok(fetched(
                vec![key("k2", KeyStatus::Active), key("k1", KeyStatus::Revoked)],
                None,
            ))
        });
        let cache = KeyCache::new(Arc::new(source), Duration::from_secs(300));

        cache.refresh(&domain(), Duration::from_secs(5)).await.unwrap();
        assert!(cache.lookup(&domain(), "k1").await.is_none());
        assert_eq!(cache.status_of(&domain(), "k1").await, Some(KeyStatus::Revoked));

        let result = cache.resolve_key(&domain(), "k1", Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::UnknownKey)));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_stale_set() {
        let mut source = MockKeySource::new();
        let mut seq = mockall::Sequence::new();
        source
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(fetched(vec![key("k1", KeyStatus::Active)], Some(0))));
        source
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(Error::KeyFetch("connection refused".to_string())));
        let cache = KeyCache::new(Arc::new(source), Duration::from_secs(300));

        cache.refresh(&domain(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(cache.refresh_stale(Duration::from_secs(5)).await, 0);
        assert!(cache.lookup(&domain(), "k1").await.is_some());
    }

    /// 第一次获取较慢且只有旧密钥，之后的获取包含轮换后的新密钥
    struct RotatingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl KeySource for RotatingSource {
        async fn fetch(&self, _trust_domain: &TrustDomain) -> Result<FetchedKeySet> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(200)).await;
                return Ok(fetched(vec![key("k1", KeyStatus::Active)], None));
            }
            Ok(fetched(
                vec![key("k2", KeyStatus::Active), key("k1", KeyStatus::Retiring)],
                None,
            ))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_refetches_after_earlier_inflight_fetch() {
        let source = Arc::new(RotatingSource {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(KeyCache::new(source.clone(), Duration::from_secs(300)));

        let background = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.refresh(&domain(), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let key = cache.resolve_key(&domain(), "k2", Duration::from_secs(5)).await.unwrap();
        assert_eq!(key.key_id, "k2");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        background.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_reuses_inflight_fetch_containing_key() {
        let source = Arc::new(RotatingSource {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(KeyCache::new(source.clone(), Duration::from_secs(300)));

        let background = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.refresh(&domain(), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let key = cache.resolve_key(&domain(), "k1", Duration::from_secs(5)).await.unwrap();
        assert_eq!(key.key_id, "k1");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        background.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            delay: Duration::from_secs(30),
        });
        let cache = KeyCache::new(source, Duration::from_secs(300));
        let result = cache.resolve_key(&domain(), "k1", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_proactive_refresh_respects_max_age() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let cache = Arc::new(KeyCache::new(source.clone(), Duration::from_secs(300)));
        cache.warm([&domain()], Duration::from_secs(5)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        let handle = cache.clone().spawn_refresh_task(Duration::from_secs(10), Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(55)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        handle.abort();
    }
}
