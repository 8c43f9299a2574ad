//! MLLP over TCP (§4.1, §6.1): `0x0B <payload> 0x1C 0x0D`, no escaping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AdapterError;

use super::{FrameHandler, FrameMeta, InboundAdapter, OutboundAdapter, OutboundFrame};

const START: u8 = 0x0B;
const END: u8 = 0x1C;
const CR: u8 = 0x0D;
const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct SslConfig {
    pub enabled: bool,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MllpInboundConfig {
    pub port: u16,
    /// `0` closes the connection after one reply; `-1` keeps it open until
    /// the peer closes it or `read_timeout` elapses with no data.
    pub stay_connected: i32,
    pub read_timeout: Duration,
    pub ssl_config: Option<SslConfig>,
}

pub struct MllpInbound {
    config: MllpInboundConfig,
}

impl MllpInbound {
    pub fn new(config: MllpInboundConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl InboundAdapter for MllpInbound {
    async fn start(&self, cancel: CancellationToken, handler: Arc<dyn FrameHandler>) -> Result<(), AdapterError> {
        if self.config.ssl_config.as_ref().is_some_and(|c| c.enabled) {
            warn!(port = self.config.port, "ssl_config present but TLS not implemented, running plaintext");
        }
        let listener = TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .map_err(|e| AdapterError::Permanent(format!("bind {}: {e}", self.config.port)))?;
        info!(port = self.config.port, "MLLP inbound listening");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            let handler = handler.clone();
                            let config = self.config.clone();
                            let conn_cancel = cancel.child_token();
                            tokio::spawn(async move {
                                handle_connection(socket, addr.to_string(), config, handler, conn_cancel).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
        Ok(())
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    remote_addr: String,
    config: MllpInboundConfig,
    handler: Arc<dyn FrameHandler>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_mllp_frame(&mut socket, config.read_timeout) => frame,
        };
        let raw = match frame {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(e) => {
                warn!(remote_addr, error = %e, "malformed MLLP frame, closing connection");
                break;
            }
        };
        let meta = FrameMeta {
            remote_addr: Some(remote_addr.clone()),
            filename: None,
        };
        match handler.handle_frame(raw, meta).await {
            Ok(reply) if !reply.is_empty() => {
                if let Err(e) = write_mllp_frame(&mut socket, &reply).await {
                    warn!(remote_addr, error = %e, "failed to write MLLP reply");
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(remote_addr, error = %e, "frame handler error");
            }
        }
        if config.stay_connected == 0 {
            break;
        }
    }
    debug!(remote_addr, "MLLP connection closed");
}

async fn read_mllp_frame(socket: &mut TcpStream, read_timeout: Duration) -> Result<Option<Vec<u8>>, AdapterError> {
    let mut byte = [0u8; 1];
    loop {
        match timeout(read_timeout, socket.read(&mut byte)).await {
            Ok(Ok(0)) => return Ok(None),
            Ok(Ok(_)) => {
                if byte[0] == START {
                    break;
                }
            }
            Ok(Err(e)) => return Err(AdapterError::Transient(e.to_string())),
            Err(_) => return Err(AdapterError::Timeout),
        }
    }
    let mut payload = Vec::new();
    loop {
        match timeout(read_timeout, socket.read(&mut byte)).await {
            Ok(Ok(0)) => return Err(AdapterError::MalformedFrame("EOF before END CR".into())),
            Ok(Ok(_)) => {
                if byte[0] == END {
                    match timeout(read_timeout, socket.read(&mut byte)).await {
                        Ok(Ok(n)) if n > 0 && byte[0] == CR => return Ok(Some(payload)),
                        _ => return Err(AdapterError::MalformedFrame("missing terminating CR".into())),
                    }
                }
                payload.push(byte[0]);
                if payload.len() > MAX_FRAME_BYTES {
                    return Err(AdapterError::MalformedFrame("frame exceeds maximum size".into()));
                }
            }
            Ok(Err(e)) => return Err(AdapterError::Transient(e.to_string())),
            Err(_) => return Err(AdapterError::Timeout),
        }
    }
}

async fn write_mllp_frame(socket: &mut TcpStream, payload: &[u8]) -> Result<(), AdapterError> {
    let mut framed = Vec::with_capacity(payload.len() + 3);
    framed.push(START);
    framed.extend_from_slice(payload);
    framed.push(END);
    framed.push(CR);
    socket
        .write_all(&framed)
        .await
        .map_err(|e| AdapterError::Transient(e.to_string()))
}

#[derive(Debug, Clone)]
pub struct MllpOutboundConfig {
    pub ip_address: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub reconnect_retry: u32,
    /// `-1` returns the connection to the pool after a successful
    /// round-trip; any other value closes it.
    pub stay_connected: i32,
    pub ssl_config: Option<SslConfig>,
}

/// Outbound MLLP client backed by a small connection pool (§4.1).
pub struct MllpOutbound {
    config: MllpOutboundConfig,
    pool: Mutex<Vec<TcpStream>>,
}

impl MllpOutbound {
    pub fn new(config: MllpOutboundConfig) -> Self {
        Self {
            config,
            pool: Mutex::new(Vec::new()),
        }
    }

    async fn acquire(&self) -> Result<TcpStream, AdapterError> {
        if let Some(stream) = self.pool.lock().await.pop() {
            return Ok(stream);
        }
        self.connect_with_retry().await
    }

    async fn connect_with_retry(&self) -> Result<TcpStream, AdapterError> {
        let mut attempt: u32 = 0;
        loop {
            let result = timeout(
                self.config.connect_timeout,
                TcpStream::connect((self.config.ip_address.as_str(), self.config.port)),
            )
            .await;
            match result {
                Ok(Ok(stream)) => return Ok(stream),
                _ if attempt < self.config.reconnect_retry => {
                    let backoff_ms = 100u64.saturating_mul(1u64 << attempt.min(10));
                    let jitter_ms = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(backoff_ms + jitter_ms)).await;
                    attempt += 1;
                }
                _ => {
                    return Err(AdapterError::Transient(format!(
                        "connect to {}:{} failed after {} attempts",
                        self.config.ip_address, self.config.port, attempt + 1
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl OutboundAdapter for MllpOutbound {
    async fn send(&self, frame: OutboundFrame) -> Result<Vec<u8>, AdapterError> {
        if self.config.ssl_config.as_ref().is_some_and(|c| c.enabled) {
            warn!(target = %self.config.ip_address, "ssl_config present but TLS not implemented, running plaintext");
        }
        let mut stream = self.acquire().await?;
        write_mllp_frame(&mut stream, &frame.raw).await?;
        let response = read_mllp_frame(&mut stream, self.config.response_timeout)
            .await?
            .ok_or_else(|| AdapterError::Transient("peer closed before responding".into()))?;
        if self.config.stay_connected == -1 {
            self.pool.lock().await.push(stream);
        }
        Ok(response)
    }
}
