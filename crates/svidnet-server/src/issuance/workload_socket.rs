//! 工作负载本地套接字
//!
//! 在 Unix 域套接字上以逐行 JSON 的形式提供签发接口：
//!
//! ```text
//! -> {"audience":["https://kc.example.org/realms/spiffe"]}
//! <- {"svid":"eyJ...","expires_at":1700000300}
//! <- {"error":"audience_not_allowed"}
//! ```
//!
//! 对端凭据由内核提供并填入 [`CallerContext`]。拒绝时只返回错误类别，
//! 不透露注册表内容。

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use svidnet_common::{Error, Result};

use super::attestor::{CallerContext, PeerCredentials};
use super::service::IssuanceService;

/// 无法解析请求时返回的错误类别
pub const MALFORMED_REQUEST: &str = "malformed_request";

/// 工作负载请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkloadRequest {
    #[serde(default)]
    pub audience: Vec<String>,
}

/// 工作负载响应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkloadResponse {
    Svid { svid: String, expires_at: i64 },
    Error { error: String },
}

/// 工作负载套接字服务器
pub struct WorkloadSocketServer {
    service: Arc<IssuanceService>,
    default_audience: BTreeSet<String>,
    timeout: Duration,
}

impl WorkloadSocketServer {
    /// `default_audience` 用于未指定受众的请求
    pub fn new(service: Arc<IssuanceService>, default_audience: BTreeSet<String>, timeout: Duration) -> Self {
        Self {
            service,
            default_audience,
            timeout,
        }
    }

    /// 绑定套接字路径，清理上次运行遗留的文件
    pub fn bind(path: &Path) -> Result<UnixListener> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        info!("工作负载套接字监听在 {}", path.display());
        Ok(listener)
    }

    /// 接受连接直到监听器出错
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> Result<()> {
        loop {
            let (stream, _) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    debug!("工作负载连接结束: {}", e);
                }
            });
        }
    }

    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let context = match stream.peer_cred() {
            Ok(cred) => CallerContext::from_peer(PeerCredentials {
                uid: cred.uid(),
                gid: cred.gid(),
                pid: cred.pid(),
            }),
            Err(e) => {
                warn!("无法读取对端凭据: {}", e);
                CallerContext::default()
            }
        };

        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = self.handle_request(&context, &line).await;
            let mut payload = serde_json::to_vec(&response)?;
            payload.push(b'\n');
            writer.write_all(&payload).await?;
        }
        Ok(())
    }

    async fn handle_request(&self, context: &CallerContext, line: &str) -> WorkloadResponse {
        let request: WorkloadRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(_) => {
                return WorkloadResponse::Error {
                    error: MALFORMED_REQUEST.to_string(),
                }
            }
        };

        let audience: BTreeSet<String> = if request.audience.is_empty() {
            self.default_audience.clone()
        } else {
            request.audience.into_iter().collect()
        };

        match self.service.fetch(context, &audience, self.timeout).await {
            Ok(svid) => WorkloadResponse::Svid {
                svid: svid.token().to_string(),
                expires_at: svid.claims().exp,
            },
            Err(e) => {
                if let Error::InternalSigning(_) = e {
                    error!("签发失败: {}", e);
                }
                WorkloadResponse::Error {
                    error: e.kind().as_str().to_string(),
                }
            }
        }
    }
}
