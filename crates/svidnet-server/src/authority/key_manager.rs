//! 签名密钥管理模块
//!
//! 签发机构独占私钥材料，私钥从不导出。当前的密钥环（一个活动密钥加若干
//! 轮换中的密钥）是一个带版本号的不可变值，保存在 `RwLock<Arc<KeyRing>>` 中。
//! 签名时只克隆 `Arc` 快照；轮换时构造新的密钥环并整体替换引用，
//! 读者要么完整地看到旧密钥环，要么完整地看到新密钥环。

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, Ed25519KeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use svidnet_common::{Error, KeyAlgorithm, KeyStatus, PublishedKey, Result, SharedClock};

/// 生成新密钥时与历史密钥 ID 冲突的最大重试次数
const MAX_KEY_ID_ATTEMPTS: usize = 4;

enum KeyPairKind {
    Ecdsa(EcdsaKeyPair),
    Ed25519(Ed25519KeyPair),
}

/// 签名密钥（含私钥）
pub struct SigningKey {
    key_id: String,
    algorithm: KeyAlgorithm,
    key_pair: KeyPairKind,
    public_key: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl SigningKey {
    /// 生成新的密钥对
    pub fn generate(algorithm: KeyAlgorithm, created_at: DateTime<Utc>) -> Result<Self> {
        let rng = SystemRandom::new();
        let key_pair = match algorithm {
            KeyAlgorithm::Es256 => {
                let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
                    .map_err(|_| Error::InternalSigning("生成 P-256 密钥失败".to_string()))?;
                let pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
                    .map_err(|e| Error::InternalSigning(format!("解析 P-256 密钥失败: {}", e)))?;
                KeyPairKind::Ecdsa(pair)
            }
            KeyAlgorithm::EdDsa => {
                let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
                    .map_err(|_| Error::InternalSigning("生成 Ed25519 密钥失败".to_string()))?;
                let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
                    .map_err(|e| Error::InternalSigning(format!("解析 Ed25519 密钥失败: {}", e)))?;
                KeyPairKind::Ed25519(pair)
            }
        };

        let public_key = match &key_pair {
            KeyPairKind::Ecdsa(pair) => pair.public_key().as_ref().to_vec(),
            KeyPairKind::Ed25519(pair) => pair.public_key().as_ref().to_vec(),
        };

        Ok(Self {
            key_id: derive_key_id(&public_key),
            algorithm,
            key_pair,
            public_key,
            created_at,
        })
    }

    /// 对消息签名
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        match &self.key_pair {
            KeyPairKind::Ecdsa(pair) => {
                let rng = SystemRandom::new();
                pair.sign(&rng, message)
                    .map(|sig| sig.as_ref().to_vec())
                    .map_err(|_| Error::InternalSigning("ECDSA 签名失败".to_string()))
            }
            KeyPairKind::Ed25519(pair) => Ok(pair.sign(message).as_ref().to_vec()),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// 公钥原始字节
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn publish(&self, status: KeyStatus) -> PublishedKey {
        PublishedKey::new(&self.key_id, self.algorithm, &self.public_key, status)
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// 密钥 ID：公钥 SHA-256 摘要前 16 字节的 base64url 编码
fn derive_key_id(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    URL_SAFE_NO_PAD.encode(&digest[..16])
}

/// 轮换中的密钥，宽限期结束后被吊销
#[derive(Debug, Clone)]
pub struct RetiringKey {
    pub key: Arc<SigningKey>,
    pub retired_at: DateTime<Utc>,
    pub revoke_at: DateTime<Utc>,
}

/// 已吊销密钥的记录，私钥已清除
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokedKey {
    pub key_id: String,
    pub algorithm: KeyAlgorithm,
    pub revoked_at: DateTime<Utc>,
}

/// 带版本号的不可变密钥环
#[derive(Debug, Clone)]
pub struct KeyRing {
    version: u64,
    active: Arc<SigningKey>,
    /// 最新的在前
    retiring: Vec<RetiringKey>,
    revoked: Vec<RevokedKey>,
    /// 所有使用过的密钥 ID，保证不复用
    used_key_ids: BTreeSet<String>,
}

impl KeyRing {
    fn initial(active: SigningKey) -> Self {
        let used_key_ids = BTreeSet::from([active.key_id.clone()]);
        Self {
            version: 1,
            active: Arc::new(active),
            retiring: Vec::new(),
            revoked: Vec::new(),
            used_key_ids,
        }
    }

    /// 版本号，每次轮换或吊销后递增
    pub fn version(&self) -> u64 {
        self.version
    }

    /// 当前签名密钥
    pub fn active(&self) -> &Arc<SigningKey> {
        &self.active
    }

    pub fn retiring(&self) -> &[RetiringKey] {
        &self.retiring
    }

    pub fn revoked(&self) -> &[RevokedKey] {
        &self.revoked
    }

    /// 查询密钥状态
    pub fn status_of(&self, key_id: &str) -> Option<KeyStatus> {
        if self.active.key_id == key_id {
            Some(KeyStatus::Active)
        } else if self.retiring.iter().any(|r| r.key.key_id == key_id) {
            Some(KeyStatus::Retiring)
        } else if self.revoked.iter().any(|r| r.key_id == key_id) {
            Some(KeyStatus::Revoked)
        } else {
            None
        }
    }

    /// 可用于验证的公钥，最新的在前（活动密钥、然后按轮换时间倒序）
    pub fn published_keys(&self) -> Vec<PublishedKey> {
        std::iter::once(self.active.publish(KeyStatus::Active))
            .chain(self.retiring.iter().map(|r| r.key.publish(KeyStatus::Retiring)))
            .collect()
    }
}

/// 签名密钥管理器
pub struct KeyManager {
    ring: RwLock<Arc<KeyRing>>,
    algorithm: KeyAlgorithm,
    grace_window: Duration,
    clock: SharedClock,
}

impl KeyManager {
    /// 创建密钥管理器并生成第一把活动密钥
    pub fn new(algorithm: KeyAlgorithm, grace_window: Duration, clock: SharedClock) -> Result<Self> {
        if grace_window <= Duration::zero() {
            return Err(Error::Config("宽限期必须大于 0".to_string()));
        }
        let active = SigningKey::generate(algorithm, clock.now())?;
        info!(key_id = %active.key_id(), algorithm = %algorithm, "生成初始签名密钥");

        Ok(Self {
            ring: RwLock::new(Arc::new(KeyRing::initial(active))),
            algorithm,
            grace_window,
            clock,
        })
    }

    /// 当前密钥环快照
    pub async fn current(&self) -> Arc<KeyRing> {
        self.ring.read().await.clone()
    }

    /// 宽限期
    pub fn grace_window(&self) -> Duration {
        self.grace_window
    }

    /// 轮换签名密钥：生成新的活动密钥，旧活动密钥进入轮换状态
    pub async fn rotate(&self) -> Result<Arc<KeyRing>> {
        let mut guard = self.ring.write().await;
        let now = self.clock.now();

        let mut candidate = SigningKey::generate(self.algorithm, now)?;
        let mut attempts = 1;
        while guard.used_key_ids.contains(candidate.key_id()) {
            if attempts >= MAX_KEY_ID_ATTEMPTS {
                return Err(Error::InternalSigning("无法生成未使用过的密钥 ID".to_string()));
            }
            warn!(key_id = %candidate.key_id(), "新密钥 ID 与历史密钥冲突，重新生成");
            candidate = SigningKey::generate(self.algorithm, now)?;
            attempts += 1;
        }

        let mut next = guard.as_ref().clone();
        let previous = std::mem::replace(&mut next.active, Arc::new(candidate));
        next.used_key_ids.insert(next.active.key_id.clone());
        next.retiring.insert(
            0,
            RetiringKey {
                key: previous.clone(),
                retired_at: now,
                revoke_at: now + self.grace_window,
            },
        );
        next.version += 1;

        info!(
            new_key_id = %next.active.key_id(),
            retiring_key_id = %previous.key_id(),
            version = next.version,
            "签名密钥已轮换"
        );

        let next = Arc::new(next);
        *guard = next.clone();
        Ok(next)
    }

    /// 吊销宽限期已结束的轮换中密钥并清除其私钥，返回吊销数量
    pub async fn prune(&self) -> usize {
        let now = self.clock.now();
        {
            let current = self.ring.read().await;
            if !current.retiring.iter().any(|r| r.revoke_at <= now) {
                return 0;
            }
        }

        let mut guard = self.ring.write().await;
        let mut next = guard.as_ref().clone();
        let (expired, kept): (Vec<RetiringKey>, Vec<RetiringKey>) =
            next.retiring.into_iter().partition(|r| r.revoke_at <= now);
        next.retiring = kept;

        let count = expired.len();
        for retired in expired {
            debug!(key_id = %retired.key.key_id(), "吊销轮换中的密钥");
            next.revoked.push(RevokedKey {
                key_id: retired.key.key_id.clone(),
                algorithm: retired.key.algorithm,
                revoked_at: now,
            });
        }
        if count > 0 {
            next.version += 1;
            info!(count, version = next.version, "已吊销宽限期结束的密钥");
            *guard = Arc::new(next);
        }
        count
    }

    /// 立即吊销指定的轮换中密钥（例如怀疑泄露），活动密钥需先轮换
    pub async fn revoke(&self, key_id: &str) -> Result<()> {
        let mut guard = self.ring.write().await;
        match guard.status_of(key_id) {
            Some(KeyStatus::Revoked) => return Ok(()),
            Some(status) if !status.can_transition_to(KeyStatus::Revoked) => {
                return Err(Error::InternalSigning("活动密钥必须先轮换才能吊销".to_string()))
            }
            Some(_) => {}
            None => return Err(Error::InternalSigning(format!("未知的密钥: {}", key_id))),
        }

        let now = self.clock.now();
        let mut next = guard.as_ref().clone();
        next.retiring.retain(|r| r.key.key_id != key_id);
        next.revoked.push(RevokedKey {
            key_id: key_id.to_string(),
            algorithm: self.algorithm,
            revoked_at: now,
        });
        next.version += 1;
        warn!(key_id = %key_id, version = next.version, "密钥被提前吊销");
        *guard = Arc::new(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::signature::{UnparsedPublicKey, ECDSA_P256_SHA256_FIXED, ED25519};
    use rstest::rstest;
    use svidnet_common::ManualClock;

    fn manager(clock: &ManualClock) -> KeyManager {
        KeyManager::new(KeyAlgorithm::Es256, Duration::seconds(600), Arc::new(clock.clone())).unwrap()
    }

    #[rstest]
    #[case(KeyAlgorithm::Es256)]
    #[case(KeyAlgorithm::EdDsa)]
    fn test_sign_and_verify(#[case] algorithm: KeyAlgorithm) {
        let key = SigningKey::generate(algorithm, Utc::now()).unwrap();
        let sig = key.sign(b"header.claims").unwrap();

        let verify_alg: &'static dyn ring::signature::VerificationAlgorithm = match algorithm {
            KeyAlgorithm::Es256 => &ECDSA_P256_SHA256_FIXED,
            KeyAlgorithm::EdDsa => &ED25519,
        };
        let public = UnparsedPublicKey::new(verify_alg, key.public_key());
        assert!(public.verify(b"header.claims", &sig).is_ok());
        assert!(public.verify(b"header.other", &sig).is_err());
    }

    #[test]
    fn test_key_id_is_stable_thumbprint() {
        let key = SigningKey::generate(KeyAlgorithm::Es256, Utc::now()).unwrap();
        assert_eq!(key.key_id(), derive_key_id(key.public_key()));
        assert_eq!(key.key_id().len(), 22);
        assert!(!format!("{:?}", key).contains("key_pair"));
    }

    #[tokio::test]
    async fn test_rotation_retires_previous_key() {
        let clock = ManualClock::new(1_700_000_000);
        let keys = manager(&clock);
        let before = keys.current().await;
        let old_id = before.active().key_id().to_string();

        let after = keys.rotate().await.unwrap();
        assert_eq!(after.version(), before.version() + 1);
        assert_ne!(after.active().key_id(), old_id);
        assert_eq!(after.status_of(&old_id), Some(KeyStatus::Retiring));

        let published = after.published_keys();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].status, KeyStatus::Active);
        assert_eq!(published[1].key_id, old_id);

        // 旧快照不受影响
        assert_eq!(before.status_of(&old_id), Some(KeyStatus::Active));
    }

    #[tokio::test]
    async fn test_prune_revokes_after_grace_window() {
        let clock = ManualClock::new(1_700_000_000);
        let keys = manager(&clock);
        let old_id = keys.current().await.active().key_id().to_string();
        keys.rotate().await.unwrap();

        clock.advance(Duration::seconds(599));
        assert_eq!(keys.prune().await, 0);
        assert_eq!(keys.current().await.status_of(&old_id), Some(KeyStatus::Retiring));

        clock.advance(Duration::seconds(1));
        assert_eq!(keys.prune().await, 1);
        let ring = keys.current().await;
        assert_eq!(ring.status_of(&old_id), Some(KeyStatus::Revoked));
        assert!(ring.published_keys().iter().all(|k| k.key_id != old_id));
    }

    #[tokio::test]
    async fn test_revoke_rules() {
        let clock = ManualClock::new(1_700_000_000);
        let keys = manager(&clock);
        let first = keys.current().await.active().key_id().to_string();
        assert!(keys.revoke(&first).await.is_err());

        keys.rotate().await.unwrap();
        keys.revoke(&first).await.unwrap();
        assert_eq!(keys.current().await.status_of(&first), Some(KeyStatus::Revoked));
        // 重复吊销是幂等的
        keys.revoke(&first).await.unwrap();
        assert!(keys.revoke("no-such-key").await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_readers_see_whole_rings() {
        let clock = ManualClock::new(1_700_000_000);
        let keys = Arc::new(manager(&clock));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let keys = keys.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let ring = keys.current().await;
                    let published = ring.published_keys();
                    assert_eq!(published[0].key_id, ring.active().key_id());
                    assert_eq!(published.len(), 1 + ring.retiring().len());
                }
            }));
        }
        for _ in 0..10 {
            keys.rotate().await.unwrap();
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(keys.current().await.version(), 11);
    }
}
