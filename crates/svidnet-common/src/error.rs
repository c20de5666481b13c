//! 错误处理模块
//!
//! 该模块提供 SVIDNet 项目的统一错误处理机制。错误分为三类：
//! 签发拒绝（配置或策略原因，不应自动重试）、验证失败（文档本身无效，
//! 调用方需要获取新文档）以及基础设施故障（可退避重试）。
//!
//! 跨越信任边界时只暴露 [`ErrorKind`]，不携带选择器匹配细节、
//! 比较值或任何密钥材料。

use std::fmt;
use std::io;
use thiserror::Error;

/// SVIDNet 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 调用方身份无法证明
    #[error("工作负载未通过证明")]
    NotAttested,

    /// 没有注册条目匹配
    #[error("没有匹配的注册条目")]
    NoMatch,

    /// 多个注册条目同时匹配
    #[error("存在多个匹配的注册条目")]
    AmbiguousMatch,

    /// 请求的受众不在条目允许范围内
    #[error("请求的受众不被允许")]
    AudienceNotAllowed,

    /// 签名校验失败
    #[error("签名无效")]
    SignatureInvalid,

    /// 文档已过期
    #[error("文档已过期")]
    Expired,

    /// 期望受众不在文档受众中
    #[error("受众不匹配")]
    AudienceMismatch,

    /// 签发者不受信任
    #[error("签发者不受信任")]
    UntrustedIssuer,

    /// 找不到对应的公钥
    #[error("未知的签名密钥")]
    UnknownKey,

    /// 文档无法解码
    #[error("文档格式错误")]
    MalformedDocument,

    /// 调用超过截止时间
    #[error("操作超时")]
    Timeout,

    /// 签名内部错误
    #[error("内部签名错误: {0}")]
    InternalSigning(String),

    /// 公钥集获取失败
    #[error("密钥集获取失败: {0}")]
    KeyFetch(String),

    /// OAuth2 令牌端点拒绝断言
    #[error("令牌交换被拒绝: {0}")]
    TokenExchangeRejected(String),

    /// 注册表管理操作无效
    #[error("注册表错误: {0}")]
    Registry(String),

    /// SPIFFE ID 格式无效
    #[error("无效的 SPIFFE ID: {0}")]
    InvalidSpiffeId(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 网络错误
    #[error("网络错误: {0}")]
    Network(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] io::Error),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

/// SVIDNet 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

/// 不携带任何细节的错误类别，可以安全地返回给不受信任的调用方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotAttested,
    NoMatch,
    AmbiguousMatch,
    AudienceNotAllowed,
    SignatureInvalid,
    Expired,
    AudienceMismatch,
    UntrustedIssuer,
    UnknownKey,
    MalformedDocument,
    Timeout,
    InternalSigningError,
    KeyFetchError,
    TokenExchangeRejected,
    Internal,
}

impl ErrorKind {
    /// 是否为暂时性故障（可退避后重试）
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::InternalSigningError | ErrorKind::KeyFetchError
        )
    }

    /// 稳定的字符串标识，用于线上协议和指标标签
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotAttested => "not_attested",
            ErrorKind::NoMatch => "no_match",
            ErrorKind::AmbiguousMatch => "ambiguous_match",
            ErrorKind::AudienceNotAllowed => "audience_not_allowed",
            ErrorKind::SignatureInvalid => "signature_invalid",
            ErrorKind::Expired => "expired",
            ErrorKind::AudienceMismatch => "audience_mismatch",
            ErrorKind::UntrustedIssuer => "untrusted_issuer",
            ErrorKind::UnknownKey => "unknown_key",
            ErrorKind::MalformedDocument => "malformed_document",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InternalSigningError => "internal_signing_error",
            ErrorKind::KeyFetchError => "key_fetch_error",
            ErrorKind::TokenExchangeRejected => "token_exchange_rejected",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// 获取错误类别
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotAttested => ErrorKind::NotAttested,
            Error::NoMatch => ErrorKind::NoMatch,
            Error::AmbiguousMatch => ErrorKind::AmbiguousMatch,
            Error::AudienceNotAllowed => ErrorKind::AudienceNotAllowed,
            Error::SignatureInvalid => ErrorKind::SignatureInvalid,
            Error::Expired => ErrorKind::Expired,
            Error::AudienceMismatch => ErrorKind::AudienceMismatch,
            Error::UntrustedIssuer => ErrorKind::UntrustedIssuer,
            Error::UnknownKey => ErrorKind::UnknownKey,
            Error::MalformedDocument => ErrorKind::MalformedDocument,
            Error::Timeout => ErrorKind::Timeout,
            Error::InternalSigning(_) => ErrorKind::InternalSigningError,
            Error::KeyFetch(_) => ErrorKind::KeyFetchError,
            Error::TokenExchangeRejected(_) => ErrorKind::TokenExchangeRejected,
            Error::Registry(_)
            | Error::InvalidSpiffeId(_)
            | Error::Config(_)
            | Error::Network(_)
            | Error::Io(_)
            | Error::Json(_) => ErrorKind::Internal,
        }
    }

    /// 是否为暂时性故障
    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}
