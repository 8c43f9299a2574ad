//! The persisted trace (§4.6): one row per unique body, one row per leg.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::TraceError;
use crate::types::{BodyProtocolFields, BodyRow, HeaderFields, HeaderRow, HeaderStatus};

pub use memory::MemoryTrace;
#[cfg(feature = "postgres")]
pub use postgres::PostgresTrace;

/// Storage abstraction for `message_bodies` / `message_headers`: one async
/// trait, two implementations (in-process and Postgres).
#[async_trait]
pub trait Trace: Send + Sync {
    async fn store_body(
        &self,
        raw: Vec<u8>,
        body_class_name: &str,
        content_type: &str,
        protocol_fields: BodyProtocolFields,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Uuid, TraceError>;

    async fn store_header(&self, fields: HeaderFields) -> Result<(Uuid, u64), TraceError>;

    async fn update_header_status(
        &self,
        header_id: Uuid,
        status: HeaderStatus,
        is_error: bool,
        error_status: Option<String>,
    ) -> Result<(), TraceError>;

    async fn trace_for_session(&self, session_id: &str) -> Result<Vec<HeaderRow>, TraceError>;

    async fn get_header(&self, header_id: Uuid) -> Result<Option<HeaderRow>, TraceError>;

    async fn get_body(&self, body_id: Uuid) -> Result<Option<BodyRow>, TraceError>;
}
