//! HTTP inbound (axum) and outbound (reqwest) adapters (§4.1).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::routing::any;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::AdapterError;

use super::mllp::SslConfig;
use super::{FrameHandler, FrameMeta, InboundAdapter, OutboundAdapter, OutboundFrame};

#[derive(Debug, Clone)]
pub struct HttpInboundConfig {
    pub port: u16,
    pub base_path: String,
    pub allowed_methods: Vec<String>,
    pub max_body_size: usize,
    pub enable_cors: bool,
    pub ssl_config: Option<SslConfig>,
}

pub struct HttpInbound {
    config: HttpInboundConfig,
}

impl HttpInbound {
    pub fn new(config: HttpInboundConfig) -> Self {
        Self { config }
    }
}

#[derive(Clone)]
struct RouteState {
    handler: Arc<dyn FrameHandler>,
    allowed_methods: Vec<String>,
}

async fn route_handler(State(state): State<RouteState>, method: Method, body: Bytes) -> (StatusCode, Vec<u8>) {
    if !state
        .allowed_methods
        .iter()
        .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    {
        return (StatusCode::METHOD_NOT_ALLOWED, Vec::new());
    }
    let meta = FrameMeta::default();
    match state.handler.handle_frame(body.to_vec(), meta).await {
        Ok(reply) => (StatusCode::OK, reply),
        Err(AdapterError::MalformedFrame(_)) => (StatusCode::UNPROCESSABLE_ENTITY, Vec::new()),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, Vec::new()),
    }
}

#[async_trait]
impl InboundAdapter for HttpInbound {
    async fn start(&self, cancel: CancellationToken, handler: Arc<dyn FrameHandler>) -> Result<(), AdapterError> {
        if self.config.ssl_config.as_ref().is_some_and(|c| c.enabled) {
            warn!(port = self.config.port, "ssl_config present but TLS not implemented, running plaintext");
        }
        let state = RouteState {
            handler,
            allowed_methods: self.config.allowed_methods.clone(),
        };
        let app = Router::new()
            .route(&self.config.base_path, any(route_handler))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .map_err(|e| AdapterError::Permanent(format!("bind {}: {e}", self.config.port)))?;
        info!(port = self.config.port, base_path = %self.config.base_path, "HTTP inbound listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct HttpOutboundConfig {
    pub url: String,
    pub method: String,
    pub content_type: String,
    pub custom_headers: HashMap<String, String>,
    pub response_timeout: Duration,
    pub ssl_config: Option<SslConfig>,
}

pub struct HttpOutbound {
    config: HttpOutboundConfig,
    client: reqwest::Client,
}

impl HttpOutbound {
    pub fn new(config: HttpOutboundConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl OutboundAdapter for HttpOutbound {
    async fn send(&self, frame: OutboundFrame) -> Result<Vec<u8>, AdapterError> {
        if self.config.ssl_config.as_ref().is_some_and(|c| c.enabled) {
            warn!(url = %self.config.url, "ssl_config present but TLS not implemented, running plaintext");
        }
        let method = reqwest::Method::from_bytes(self.config.method.as_bytes())
            .unwrap_or(reqwest::Method::POST);
        let mut req = self
            .client
            .request(method, &self.config.url)
            .header("content-type", &self.config.content_type)
            .body(frame.raw);
        for (key, value) in &self.config.custom_headers {
            req = req.header(key, value);
        }
        let response = tokio::time::timeout(self.config.response_timeout, req.send())
            .await
            .map_err(|_| AdapterError::Timeout)?
            .map_err(|e| AdapterError::Transient(e.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?
            .to_vec();
        if status.is_client_error() {
            return Err(AdapterError::Permanent(format!("HTTP {status}")));
        }
        if status.is_server_error() {
            return Err(AdapterError::Transient(format!("HTTP {status}")));
        }
        Ok(body)
    }
}
