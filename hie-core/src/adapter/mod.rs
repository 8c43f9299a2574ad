//! Protocol-specific I/O at the edge (§4.1). Adapters are stateless
//! regarding business semantics -- they only shuttle bytes between the
//! wire and a Host.

pub mod file;
pub mod http;
pub mod mllp;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::AdapterError;

/// Arrival metadata for one inbound frame: at minimum the remote address
/// (network adapters) or filename (file adapter).
#[derive(Debug, Clone, Default)]
pub struct FrameMeta {
    pub remote_addr: Option<String>,
    pub filename: Option<String>,
}

/// The callback an inbound adapter invokes for each received frame. Hosts
/// (`host::service::ServiceHost`) implement this so the adapter never needs
/// to know about envelopes, queues, or the trace.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle_frame(&self, raw: Vec<u8>, meta: FrameMeta) -> Result<Vec<u8>, AdapterError>;
}

/// A push source: produces frames whose arrival triggers host work (§4.1).
#[async_trait]
pub trait InboundAdapter: Send + Sync {
    /// Begin producing frames, invoking `handler` for each. Returns once
    /// `cancel` fires and all in-flight callbacks have completed.
    async fn start(&self, cancel: CancellationToken, handler: std::sync::Arc<dyn FrameHandler>) -> Result<(), AdapterError>;
}

/// One outbound frame plus the metadata the file adapter's filename
/// template (`%type%`, `%id%`, §6.1) needs; other adapters ignore the
/// extra fields.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub raw: Vec<u8>,
    pub message_type: String,
    pub id: String,
}

/// A pull sink: the host hands it a frame and receives a response (§4.1).
#[async_trait]
pub trait OutboundAdapter: Send + Sync {
    async fn connect(&self, cancel: CancellationToken) -> Result<(), AdapterError> {
        let _ = cancel;
        Ok(())
    }
    async fn disconnect(&self) -> Result<(), AdapterError> {
        Ok(())
    }
    /// Send `frame.raw`; wait up to the configured `response_timeout` for a
    /// response. The returned error is classified transient/permanent so
    /// the caller's retry policy can act on it (§4.1 Failure semantics).
    async fn send(&self, frame: OutboundFrame) -> Result<Vec<u8>, AdapterError>;
}

/// Expand the file adapter's filename template tokens: `%timestamp%`,
/// `%type%`, `%id%` (§6.1).
pub fn expand_filename_template(template: &str, message_type: &str, id: &str) -> String {
    template
        .replace("%timestamp%", &crate::util::timestamp_compact())
        .replace("%type%", message_type)
        .replace("%id%", id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_filename_template_substitutes_all_tokens() {
        let name = expand_filename_template("%type%-%id%.hl7", "ADT_A01", "abc123");
        assert_eq!(name, "ADT_A01-abc123.hl7");
    }
}
