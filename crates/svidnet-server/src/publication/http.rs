//! 发布端 HTTP 服务
//!
//! 提供以下端点：
//! - `/.well-known/openid-configuration`：发现文档
//! - `/keys`：密钥集，带 `Cache-Control` 与 `ETag`，支持 `If-None-Match`
//! - `/metrics`：Prometheus 指标

use hyper::header::{self, HeaderValue};
use hyper::http::response::Builder;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use tracing::{debug, error, info};

use svidnet_common::{Error, Result};

use super::key_set::KeyPublication;
use super::rate_limit::TokenBucket;
use crate::metrics::ServerMetrics;

pub const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";
pub const KEYS_PATH: &str = "/keys";
pub const METRICS_PATH: &str = "/metrics";

/// 发布端 HTTP 服务
pub struct PublicationServer {
    publication: Arc<KeyPublication>,
    limiter: TokenBucket,
    metrics: Arc<ServerMetrics>,
}

impl PublicationServer {
    pub fn new(publication: Arc<KeyPublication>, limiter: TokenBucket, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            publication,
            limiter,
            metrics,
        }
    }

    /// 绑定地址并开始服务
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)?;
        self.run(listener).await
    }

    /// 在已绑定的监听器上服务
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let make_svc = make_service_fn(move |_| {
            let server = self.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.handle(req).await) }
                }))
            }
        });

        info!("密钥发布服务启动在 {}", addr);
        Server::from_tcp(listener)
            .map_err(|e| Error::Network(e.to_string()))?
            .serve(make_svc)
            .await
            .map_err(|e| Error::Network(e.to_string()))
    }

    /// 处理单个请求
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return status(StatusCode::METHOD_NOT_ALLOWED);
        }

        match req.uri().path() {
            DISCOVERY_PATH => self.handle_discovery(),
            KEYS_PATH => self.handle_keys(&req).await,
            METRICS_PATH => self.handle_metrics(),
            _ => status(StatusCode::NOT_FOUND),
        }
    }

    fn handle_discovery(&self) -> Response<Body> {
        match serde_json::to_vec(&self.publication.discovery()) {
            Ok(body) => build(
                Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "application/json"),
                Body::from(body),
            ),
            Err(e) => {
                error!("编码发现文档失败: {}", e);
                status(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    async fn handle_keys(&self, req: &Request<Body>) -> Response<Body> {
        if !self.limiter.try_acquire() {
            self.metrics.record_rate_limited();
            let retry_after = self.limiter.retry_after().as_secs().max(1);
            debug!(retry_after, "密钥集请求被限流");
            return build(
                Response::builder()
                    .status(StatusCode::TOO_MANY_REQUESTS)
                    .header(header::RETRY_AFTER, retry_after.to_string()),
                Body::empty(),
            );
        }
        self.metrics.record_keyset_request();

        let rendered = match self.publication.rendered().await {
            Ok(rendered) => rendered,
            Err(e) => {
                error!("渲染密钥集失败: {}", e);
                return status(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        let cache_control = format!("public, max-age={}", self.publication.max_age().as_secs());
        let not_modified = req
            .headers()
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').any(|tag| tag.trim() == rendered.etag || tag.trim() == "*"))
            .unwrap_or(false);

        let builder = Response::builder()
            .header(header::CACHE_CONTROL, cache_control)
            .header(header::ETAG, rendered.etag.as_str());

        if not_modified {
            return build(builder.status(StatusCode::NOT_MODIFIED), Body::empty());
        }
        build(
            builder
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json"),
            Body::from(rendered.body.clone()),
        )
    }

    fn handle_metrics(&self) -> Response<Body> {
        match self.metrics.encode() {
            Ok((content_type, body)) => build(
                Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, content_type),
                Body::from(body),
            ),
            Err(e) => {
                error!("编码指标失败: {}", e);
                status(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

fn status(code: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = code;
    response
}

fn build(builder: Builder, body: Body) -> Response<Body> {
    builder.body(body).unwrap_or_else(|e| {
        error!("构造响应失败: {}", e);
        let mut response = status(StatusCode::INTERNAL_SERVER_ERROR);
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    })
}
