//! 选择器模块
//!
//! 选择器是作用于已证明工作负载属性的谓词，只包含有限的几种变体：
//! 相等、前缀和集合成员。匹配过程确定且无副作用。
//!
//! 文本形式：
//! - `label=workload`：相等
//! - `unix:path^=/usr/bin/`：前缀
//! - `unix:uid in 1000,1001`：集合成员

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use svidnet_common::{Error, Result};

/// 已证明的工作负载属性（属性名 → 属性值）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadAttributes(BTreeMap<String, String>);

impl WorkloadAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置属性并返回自身，便于链式构造
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.0.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for WorkloadAttributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// 选择器
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Selector {
    /// 属性值等于给定值
    Equals { key: String, value: String },
    /// 属性值以给定前缀开头
    Prefix { key: String, prefix: String },
    /// 属性值属于给定集合
    OneOf { key: String, values: BTreeSet<String> },
}

impl Selector {
    pub fn equals(key: &str, value: &str) -> Self {
        Selector::Equals {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    pub fn prefix(key: &str, prefix: &str) -> Self {
        Selector::Prefix {
            key: key.to_string(),
            prefix: prefix.to_string(),
        }
    }

    pub fn one_of<I, S>(key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Selector::OneOf {
            key: key.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// 作用的属性名
    pub fn key(&self) -> &str {
        match self {
            Selector::Equals { key, .. } | Selector::Prefix { key, .. } | Selector::OneOf { key, .. } => key,
        }
    }

    /// 对属性求值，缺失的属性视为不匹配
    pub fn matches(&self, attributes: &WorkloadAttributes) -> bool {
        let Some(actual) = attributes.get(self.key()) else {
            return false;
        };
        match self {
            Selector::Equals { value, .. } => actual == value,
            Selector::Prefix { prefix, .. } => actual.starts_with(prefix.as_str()),
            Selector::OneOf { values, .. } => values.contains(actual),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Equals { key, value } => write!(f, "{}={}", key, value),
            Selector::Prefix { key, prefix } => write!(f, "{}^={}", key, prefix),
            Selector::OneOf { key, values } => {
                let joined: Vec<&str> = values.iter().map(String::as_str).collect();
                write!(f, "{} in {}", key, joined.join(","))
            }
        }
    }
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || Error::Registry(format!("无效的选择器: {}", s));

        // 按最先出现的运算符切分，右侧的值可以包含其他运算符
        let operator = [" in ", "^=", "="]
            .into_iter()
            .filter_map(|op| s.find(op).map(|pos| (pos, op)))
            .min_by_key(|(pos, _)| *pos);
        let Some((pos, op)) = operator else {
            return Err(invalid());
        };
        let key = s[..pos].trim();
        let rest = &s[pos + op.len()..];
        if key.is_empty() {
            return Err(invalid());
        }

        match op {
            " in " => {
                let values: BTreeSet<String> = rest
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect();
                if values.is_empty() {
                    return Err(invalid());
                }
                Ok(Selector::OneOf {
                    key: key.to_string(),
                    values,
                })
            }
            "^=" if rest.is_empty() => Err(invalid()),
            "^=" => Ok(Selector::prefix(key, rest)),
            _ => Ok(Selector::equals(key, rest)),
        }
    }
}

/// 选择器集合，全部满足才算匹配；空集合永不匹配
pub fn all_match(selectors: &[Selector], attributes: &WorkloadAttributes) -> bool {
    !selectors.is_empty() && selectors.iter().all(|s| s.matches(attributes))
}
