//! 注册条目存储模块
//!
//! 保存从工作负载选择器到 SPIFFE 身份的映射以及签发策略（允许的受众、TTL）。
//! 条目列表以不可变快照的形式保存在 `RwLock<Arc<_>>` 中：管理操作复制后
//! 整体替换，解析操作只持有某一时刻的完整快照，不会看到写了一半的条目。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use svidnet_common::{Error, Result, SpiffeId};

use super::selector::{all_match, Selector, WorkloadAttributes};

/// 注册条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    /// 条目 ID
    pub entry_id: String,
    /// 证明该工作负载的节点/代理身份
    pub parent_id: SpiffeId,
    /// 选择器，全部满足才匹配
    pub selectors: Vec<Selector>,
    /// 签发的目标身份
    pub spiffe_id: SpiffeId,
    /// 允许的受众
    pub allowed_audiences: BTreeSet<String>,
    /// 文档有效期
    pub ttl: Duration,
}

impl RegistryEntry {
    /// 创建新的注册条目，自动生成条目 ID
    pub fn new(
        parent_id: SpiffeId,
        selectors: Vec<Selector>,
        spiffe_id: SpiffeId,
        allowed_audiences: BTreeSet<String>,
        ttl: Duration,
    ) -> Result<Self> {
        let entry = Self {
            entry_id: Uuid::new_v4().to_string(),
            parent_id,
            selectors,
            spiffe_id,
            allowed_audiences,
            ttl,
        };
        entry.validate()?;
        Ok(entry)
    }

    /// 指定条目 ID
    pub fn with_entry_id(mut self, entry_id: &str) -> Self {
        self.entry_id = entry_id.to_string();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.entry_id.is_empty() {
            return Err(Error::Registry("条目 ID 不能为空".to_string()));
        }
        if self.selectors.is_empty() {
            return Err(Error::Registry("条目至少需要一个选择器".to_string()));
        }
        if self.spiffe_id.is_trust_domain_id() {
            return Err(Error::Registry("不能为信任域 ID 签发文档".to_string()));
        }
        if self.allowed_audiences.is_empty() || self.allowed_audiences.iter().any(|a| a.is_empty()) {
            return Err(Error::Registry("允许的受众不能为空".to_string()));
        }
        if self.ttl.is_zero() {
            return Err(Error::Registry("TTL 必须大于 0".to_string()));
        }
        Ok(())
    }

    /// 条目是否匹配给定的父身份和工作负载属性
    pub fn matches(&self, parent_id: &SpiffeId, attributes: &WorkloadAttributes) -> bool {
        &self.parent_id == parent_id && all_match(&self.selectors, attributes)
    }

    /// 是否与另一条目完全相同（忽略条目 ID 与策略）
    fn same_binding(&self, other: &RegistryEntry) -> bool {
        let mine: BTreeSet<&Selector> = self.selectors.iter().collect();
        let theirs: BTreeSet<&Selector> = other.selectors.iter().collect();
        self.parent_id == other.parent_id && self.spiffe_id == other.spiffe_id && mine == theirs
    }
}

type Snapshot = Arc<Vec<Arc<RegistryEntry>>>;

/// 身份注册表
#[derive(Default)]
pub struct IdentityRegistry {
    entries: RwLock<Snapshot>,
}

impl IdentityRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 由初始条目创建注册表
    pub async fn with_entries(entries: Vec<RegistryEntry>) -> Result<Self> {
        let registry = Self::new();
        for entry in entries {
            registry.create_entry(entry).await?;
        }
        Ok(registry)
    }

    async fn snapshot(&self) -> Snapshot {
        self.entries.read().await.clone()
    }

    /// 解析调用方对应的唯一条目
    ///
    /// 零个匹配返回 [`Error::NoMatch`]，多个匹配返回 [`Error::AmbiguousMatch`]。
    pub async fn resolve(
        &self,
        parent_id: &SpiffeId,
        attributes: &WorkloadAttributes,
    ) -> Result<Arc<RegistryEntry>> {
        let snapshot = self.snapshot().await;
        let mut matched = snapshot.iter().filter(|e| e.matches(parent_id, attributes));

        match (matched.next(), matched.next()) {
            (Some(entry), None) => {
                debug!(entry_id = %entry.entry_id, spiffe_id = %entry.spiffe_id, "注册条目匹配成功");
                Ok(entry.clone())
            }
            (None, _) => {
                debug!(parent_id = %parent_id, "没有匹配的注册条目");
                Err(Error::NoMatch)
            }
            (Some(_), Some(_)) => {
                warn!(parent_id = %parent_id, "存在多个匹配的注册条目，拒绝签发");
                Err(Error::AmbiguousMatch)
            }
        }
    }

    /// 创建条目
    pub async fn create_entry(&self, entry: RegistryEntry) -> Result<String> {
        entry.validate()?;
        let mut guard = self.entries.write().await;

        if guard.iter().any(|e| e.entry_id == entry.entry_id) {
            return Err(Error::Registry(format!("条目 ID 已存在: {}", entry.entry_id)));
        }
        if guard.iter().any(|e| e.same_binding(&entry)) {
            return Err(Error::Registry(format!("相同的条目已存在: {}", entry.spiffe_id)));
        }

        let entry_id = entry.entry_id.clone();
        let mut next: Vec<Arc<RegistryEntry>> = guard.iter().cloned().collect();
        info!(entry_id = %entry_id, spiffe_id = %entry.spiffe_id, "创建注册条目");
        next.push(Arc::new(entry));
        *guard = Arc::new(next);

        Ok(entry_id)
    }

    /// 删除条目
    pub async fn delete_entry(&self, entry_id: &str) -> Result<RegistryEntry> {
        let mut guard = self.entries.write().await;
        let index = guard
            .iter()
            .position(|e| e.entry_id == entry_id)
            .ok_or_else(|| Error::Registry(format!("条目不存在: {}", entry_id)))?;

        let mut next: Vec<Arc<RegistryEntry>> = guard.iter().cloned().collect();
        let removed = next.remove(index);
        *guard = Arc::new(next);

        info!(entry_id = %entry_id, "删除注册条目");
        Ok(removed.as_ref().clone())
    }

    /// 获取条目
    pub async fn get_entry(&self, entry_id: &str) -> Option<RegistryEntry> {
        self.snapshot()
            .await
            .iter()
            .find(|e| e.entry_id == entry_id)
            .map(|e| e.as_ref().clone())
    }

    /// 列出所有条目
    pub async fn list_entries(&self) -> Vec<RegistryEntry> {
        self.snapshot().await.iter().map(|e| e.as_ref().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> SpiffeId {
        SpiffeId::from_uri("spiffe://example.org/spire/agent/node-1").unwrap()
    }

    fn entry(selector: &str, spiffe_id: &str) -> RegistryEntry {
        RegistryEntry::new(
            node(),
            vec![selector.parse().unwrap()],
            SpiffeId::from_uri(spiffe_id).unwrap(),
            BTreeSet::from(["https://kc.example.org/realms/spiffe".to_string()]),
            Duration::from_secs(300),
        )
        .unwrap()
    }

    fn workload() -> WorkloadAttributes {
        WorkloadAttributes::new().with("label", "workload")
    }

    #[tokio::test]
    async fn test_resolve_single_match() {
        let registry = IdentityRegistry::with_entries(vec![
            entry("label=workload", "spiffe://example.org/mcp-client"),
            entry("label=other", "spiffe://example.org/other"),
        ])
        .await
        .unwrap();

        let resolved = registry.resolve(&node(), &workload()).await.unwrap();
        assert_eq!(resolved.spiffe_id.uri(), "spiffe://example.org/mcp-client");
    }

    #[tokio::test]
    async fn test_resolve_no_match() {
        let registry = IdentityRegistry::new();
        assert!(matches!(registry.resolve(&node(), &workload()).await, Err(Error::NoMatch)));

        registry
            .create_entry(entry("label=workload", "spiffe://example.org/mcp-client"))
            .await
            .unwrap();
        let other_node = SpiffeId::from_uri("spiffe://example.org/spire/agent/node-2").unwrap();
        assert!(matches!(registry.resolve(&other_node, &workload()).await, Err(Error::NoMatch)));
    }

    #[tokio::test]
    async fn test_resolve_ambiguous_match() {
        let registry = IdentityRegistry::with_entries(vec![
            entry("label=workload", "spiffe://example.org/a"),
            entry("label=workload", "spiffe://example.org/b"),
        ])
        .await
        .unwrap();

        assert!(matches!(
            registry.resolve(&node(), &workload()).await,
            Err(Error::AmbiguousMatch)
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let registry = IdentityRegistry::new();
        let first = entry("label=workload", "spiffe://example.org/a");
        let id = registry.create_entry(first.clone()).await.unwrap();

        assert!(registry.create_entry(first.clone()).await.is_err());
        let same_binding = first.clone().with_entry_id("another-id");
        assert!(registry.create_entry(same_binding).await.is_err());
        assert_eq!(registry.list_entries().await.len(), 1);
        assert!(registry.get_entry(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_delete_entry() {
        let registry = IdentityRegistry::new();
        let id = registry
            .create_entry(entry("label=workload", "spiffe://example.org/a"))
            .await
            .unwrap();

        let removed = registry.delete_entry(&id).await.unwrap();
        assert_eq!(removed.entry_id, id);
        assert!(registry.delete_entry(&id).await.is_err());
        assert!(matches!(registry.resolve(&node(), &workload()).await, Err(Error::NoMatch)));
    }

    #[test]
    fn test_entry_validation() {
        let empty_aud = RegistryEntry::new(
            node(),
            vec![Selector::equals("label", "workload")],
            SpiffeId::from_uri("spiffe://example.org/a").unwrap(),
            BTreeSet::new(),
            Duration::from_secs(60),
        );
        assert!(empty_aud.is_err());

        let zero_ttl = RegistryEntry::new(
            node(),
            vec![Selector::equals("label", "workload")],
            SpiffeId::from_uri("spiffe://example.org/a").unwrap(),
            BTreeSet::from(["aud".to_string()]),
            Duration::ZERO,
        );
        assert!(zero_ttl.is_err());

        let no_selectors = RegistryEntry::new(
            node(),
            Vec::new(),
            SpiffeId::from_uri("spiffe://example.org/a").unwrap(),
            BTreeSet::from(["aud".to_string()]),
            Duration::from_secs(60),
        );
        assert!(no_selectors.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_resolve_during_mutation() {
        let registry = Arc::new(
            IdentityRegistry::with_entries(vec![entry("label=workload", "spiffe://example.org/stable")])
                .await
                .unwrap(),
        );

        let writer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    let e = entry(&format!("label=churn-{}", i), &format!("spiffe://example.org/churn/{}", i));
                    let id = registry.create_entry(e).await.unwrap();
                    registry.delete_entry(&id).await.unwrap();
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let resolved = registry.resolve(&node(), &workload()).await.unwrap();
                    assert_eq!(resolved.spiffe_id.uri(), "spiffe://example.org/stable");
                }
            }));
        }

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }
}
