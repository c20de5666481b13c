//! 信任域白名单
//!
//! 空白名单不信任任何签发者。

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use svidnet_common::{Result, TrustDomain};

/// 受信任的信任域集合
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrustDomainAllowlist(BTreeSet<TrustDomain>);

impl TrustDomainAllowlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由信任域名称解析，任一名称无效则失败
    pub fn parse<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .map(|name| name.as_ref().parse::<TrustDomain>())
            .collect::<Result<BTreeSet<_>>>()
            .map(Self)
    }

    pub fn insert(&mut self, trust_domain: TrustDomain) {
        self.0.insert(trust_domain);
    }

    pub fn contains(&self, trust_domain: &TrustDomain) -> bool {
        self.0.contains(trust_domain)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrustDomain> {
        self.0.iter()
    }
}

impl FromIterator<TrustDomain> for TrustDomainAllowlist {
    fn from_iter<I: IntoIterator<Item = TrustDomain>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
