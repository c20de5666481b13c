//! 依赖方令牌交换
//!
//! 把 JWT-SVID 作为客户端断言提交给 OAuth2 令牌端点，换取访问令牌。

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use svidnet_common::{Error, JwtSvid, Result};

/// 客户端断言类型
pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-spiffe";

/// 授权类型
pub const GRANT_TYPE: &str = "client_credentials";

/// 令牌端点返回的访问令牌
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// OAuth2 错误响应
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
}

/// 令牌交换客户端
pub struct TokenExchangeClient {
    client: Client,
    token_endpoint: Url,
}

impl TokenExchangeClient {
    pub fn new(token_endpoint: Url) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self { client, token_endpoint })
    }

    pub fn token_endpoint(&self) -> &Url {
        &self.token_endpoint
    }

    /// 交换访问令牌
    ///
    /// 端点拒绝时返回 [`Error::TokenExchangeRejected`]，只携带 OAuth2 错误码。
    pub async fn exchange(&self, svid: &JwtSvid, timeout: Duration) -> Result<AccessToken> {
        let params = [
            ("grant_type", GRANT_TYPE),
            ("client_assertion_type", CLIENT_ASSERTION_TYPE),
            ("client_assertion", svid.token()),
        ];

        let request = self
            .client
            .post(self.token_endpoint.clone())
            .form(&params)
            .timeout(timeout)
            .send();
        let response = match tokio::time::timeout(timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => return Err(Error::Timeout),
            Ok(Err(e)) => return Err(Error::Network(e.to_string())),
            Err(_) => return Err(Error::Timeout),
        };

        let status = response.status();
        if !status.is_success() {
            let error = response
                .json::<TokenErrorResponse>()
                .await
                .map(|body| body.error)
                .unwrap_or_else(|_| "unknown_error".to_string());
            warn!(status = %status, error = %error, "令牌端点拒绝了断言");
            return Err(Error::TokenExchangeRejected(error));
        }

        let token: AccessToken = response
            .json()
            .await
            .map_err(|e| Error::Network(format!("令牌响应格式错误: {}", e)))?;
        debug!(expires_in = ?token.expires_in, scope = ?token.scope, "令牌交换成功");
        Ok(token)
    }
}
