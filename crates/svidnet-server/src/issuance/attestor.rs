//! 工作负载证明能力
//!
//! 证明是与运行环境相关的非纯操作（检查进程、容器元数据等），
//! 这里只定义能力接口 [`Attestor`]，由部署方按目标环境提供实现。
//! 签发服务把证明结果视为已验证的输入，不会重新推导。

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use svidnet_common::{Error, Result, SpiffeId};

use crate::registry::WorkloadAttributes;

/// 对端进程的 Unix 凭据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<i32>,
}

/// 调用方上下文，由传输层填充
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    /// 本地 IPC 时的对端凭据
    pub peer: Option<PeerCredentials>,
    /// 传输层附带的其他元数据
    pub metadata: BTreeMap<String, String>,
}

impl CallerContext {
    pub fn from_peer(peer: PeerCredentials) -> Self {
        Self {
            peer: Some(peer),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// 证明结果：证明方（节点）身份与工作负载属性
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    pub parent_id: SpiffeId,
    pub attributes: WorkloadAttributes,
}

/// 工作负载证明能力
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Attestor: Send + Sync {
    /// 证明调用方，失败时返回 [`Error::NotAttested`]
    async fn attest(&self, context: &CallerContext) -> Result<Attestation>;
}

/// 基于 Unix 套接字对端凭据的证明器
///
/// 产生 `unix:uid`、`unix:gid` 以及（可用时）`unix:pid` 属性。
pub struct UnixPeerAttestor {
    node_id: SpiffeId,
}

impl UnixPeerAttestor {
    pub fn new(node_id: SpiffeId) -> Self {
        Self { node_id }
    }
}

#[async_trait]
impl Attestor for UnixPeerAttestor {
    async fn attest(&self, context: &CallerContext) -> Result<Attestation> {
        let peer = context.peer.ok_or(Error::NotAttested)?;

        let mut attributes = WorkloadAttributes::new()
            .with("unix:uid", &peer.uid.to_string())
            .with("unix:gid", &peer.gid.to_string());
        if let Some(pid) = peer.pid {
            attributes.insert("unix:pid", &pid.to_string());
        }

        debug!(uid = peer.uid, gid = peer.gid, "通过对端凭据完成证明");
        Ok(Attestation {
            parent_id: self.node_id.clone(),
            attributes,
        })
    }
}

/// 静态证明器：按调用方元数据中的标识查表
///
/// 适用于工作负载集合固定、由外部机制保证调用方标识可信的环境。
pub struct StaticAttestor {
    node_id: SpiffeId,
    metadata_key: String,
    bindings: HashMap<String, WorkloadAttributes>,
}

impl StaticAttestor {
    /// `metadata_key` 指定调用方上下文中用作查表键的元数据
    pub fn new(node_id: SpiffeId, metadata_key: &str) -> Self {
        Self {
            node_id,
            metadata_key: metadata_key.to_string(),
            bindings: HashMap::new(),
        }
    }

    pub fn bind(mut self, caller: &str, attributes: WorkloadAttributes) -> Self {
        self.bindings.insert(caller.to_string(), attributes);
        self
    }
}

#[async_trait]
impl Attestor for StaticAttestor {
    async fn attest(&self, context: &CallerContext) -> Result<Attestation> {
        let attributes = context
            .metadata
            .get(&self.metadata_key)
            .and_then(|caller| self.bindings.get(caller))
            .cloned()
            .ok_or(Error::NotAttested)?;

        Ok(Attestation {
            parent_id: self.node_id.clone(),
            attributes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> SpiffeId {
        SpiffeId::from_uri("spiffe://example.org/spire/agent/node-1").unwrap()
    }

    #[tokio::test]
    async fn test_unix_peer_attestor() {
        let attestor = UnixPeerAttestor::new(node());
        let ctx = CallerContext::from_peer(PeerCredentials {
            uid: 1000,
            gid: 100,
            pid: Some(4242),
        });

        let attestation = attestor.attest(&ctx).await.unwrap();
        assert_eq!(attestation.parent_id, node());
        assert_eq!(attestation.attributes.get("unix:uid"), Some("1000"));
        assert_eq!(attestation.attributes.get("unix:gid"), Some("100"));
        assert_eq!(attestation.attributes.get("unix:pid"), Some("4242"));
    }

    #[tokio::test]
    async fn test_unix_peer_attestor_requires_peer() {
        let attestor = UnixPeerAttestor::new(node());
        let result = attestor.attest(&CallerContext::default()).await;
        assert!(matches!(result, Err(Error::NotAttested)));
    }

    #[tokio::test]
    async fn test_static_attestor() {
        let attestor = StaticAttestor::new(node(), "caller")
            .bind("mcp-client", WorkloadAttributes::new().with("label", "workload"));

        let ctx = CallerContext::default().with_metadata("caller", "mcp-client");
        let attestation = attestor.attest(&ctx).await.unwrap();
        assert_eq!(attestation.attributes.get("label"), Some("workload"));

        let unknown = CallerContext::default().with_metadata("caller", "intruder");
        assert!(matches!(attestor.attest(&unknown).await, Err(Error::NotAttested)));
    }
}
