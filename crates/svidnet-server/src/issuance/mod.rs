//! 身份签发模块
//!
//! 负责工作负载证明、签发请求处理以及本地套接字接口。

mod attestor;
mod service;
#[cfg(unix)]
mod workload_socket;

pub use attestor::{Attestation, Attestor, CallerContext, PeerCredentials, StaticAttestor, UnixPeerAttestor};
pub use service::IssuanceService;
#[cfg(unix)]
pub use workload_socket::{WorkloadRequest, WorkloadResponse, WorkloadSocketServer, MALFORMED_REQUEST};
