//! Core domain types: envelopes, host configuration, and the small enums
//! that drive the runtime's lifecycle and dispatch decisions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ProjectId = String;
pub type HostName = String;

/// The in-memory unit flowing between hosts. Immutable; any mutation
/// produces a new envelope (see `Envelope::derive_for_leg`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub correlation_id: Uuid,
    pub causation_id: Option<Uuid>,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub source: HostName,
    pub destination: Option<HostName>,
    pub content_type: String,
    pub schema_version: String,
    pub body_class_name: String,
    pub priority: u8,
    pub ttl: Option<u64>,
    pub retry_count: u32,
    pub raw: Vec<u8>,
    pub header_id: Uuid,
    pub body_id: Uuid,
}

impl Envelope {
    /// Start a brand-new session rooted at `source` (inbound frame arrival).
    pub fn new_session(
        source: impl Into<String>,
        raw: Vec<u8>,
        content_type: impl Into<String>,
        body_class_name: impl Into<String>,
        header_id: Uuid,
        body_id: Uuid,
    ) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            correlation_id: Uuid::now_v7(),
            causation_id: None,
            session_id: format!("SES-{}", Uuid::now_v7()),
            created_at: Utc::now(),
            source: source.into(),
            destination: None,
            content_type: content_type.into(),
            schema_version: String::new(),
            body_class_name: body_class_name.into(),
            priority: 5,
            ttl: None,
            retry_count: 0,
            raw,
            header_id,
            body_id,
        }
    }

    /// Derive a copy of this envelope for the next leg: same session and
    /// body, a new header (the leg's own trace row), and a new `source`.
    pub fn derive_for_leg(&self, new_source: impl Into<String>, header_id: Uuid) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            correlation_id: self.correlation_id,
            causation_id: Some(self.message_id),
            session_id: self.session_id.clone(),
            created_at: Utc::now(),
            source: new_source.into(),
            destination: None,
            content_type: self.content_type.clone(),
            schema_version: self.schema_version.clone(),
            body_class_name: self.body_class_name.clone(),
            priority: self.priority,
            ttl: self.ttl,
            retry_count: 0,
            raw: self.raw.clone(),
            header_id,
            body_id: self.body_id,
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.ttl {
            None => false,
            Some(ttl) => {
                let age = (Utc::now() - self.created_at).num_seconds();
                age >= 0 && age as u64 > ttl
            }
        }
    }
}

/// One of the three concrete host kinds (§3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKind {
    Service,
    Process,
    Operation,
}

/// `(source|target)_business_type` in the trace (§3.2); `External` denotes a
/// peer reached through an outbound adapter, not a configured host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessType {
    Service,
    Process,
    Operation,
    External,
}

impl From<HostKind> for BusinessType {
    fn from(k: HostKind) -> Self {
        match k {
            HostKind::Service => BusinessType::Service,
            HostKind::Process => BusinessType::Process,
            HostKind::Operation => BusinessType::Operation,
        }
    }
}

/// Host lifecycle state machine (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Created,
    Initialising,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl HostState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HostState::Stopped | HostState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Cooperative,
    ThreadPool,
    ProcessPool,
    Single,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    Never,
    OnFailure,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagingPattern {
    AsyncReliable,
    SyncReliable,
    ConcurrentAsync,
    ConcurrentSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    Fifo,
    Priority,
    Lifo,
    Unordered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    Block,
    DropOldest,
    DropNewest,
    Reject,
}

/// `message_headers.type` (§3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegType {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Invocation {
    Queue,
    InProc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegPriority {
    Async,
    Sync,
}

/// `message_headers.status` (§3.2). Once a header reaches one of the three
/// terminal variants it may not transition further (P8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderStatus {
    Created,
    Queued,
    Delivered,
    Completed,
    Error,
    Discarded,
}

impl HeaderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HeaderStatus::Completed | HeaderStatus::Error | HeaderStatus::Discarded
        )
    }
}

/// Fields needed to insert a `message_headers` row (§4.6 `StoreHeader`).
#[derive(Debug, Clone)]
pub struct HeaderFields {
    pub project_id: ProjectId,
    pub session_id: String,
    pub parent_header_id: Option<Uuid>,
    pub corresponding_header_id: Option<Uuid>,
    pub super_session_id: Option<String>,
    pub source_config_name: HostName,
    pub target_config_name: HostName,
    pub source_business_type: BusinessType,
    pub target_business_type: BusinessType,
    pub message_type: String,
    pub body_class_name: String,
    pub message_body_id: Option<Uuid>,
    pub leg_type: LegType,
    pub invocation: Invocation,
    pub leg_priority: LegPriority,
    pub description: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A `message_headers` row as returned by `TraceForSession`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderRow {
    pub id: Uuid,
    pub sequence_num: u64,
    pub project_id: ProjectId,
    pub session_id: String,
    pub parent_header_id: Option<Uuid>,
    pub corresponding_header_id: Option<Uuid>,
    pub super_session_id: Option<String>,
    pub source_config_name: HostName,
    pub target_config_name: HostName,
    pub source_business_type: BusinessType,
    pub target_business_type: BusinessType,
    pub message_type: String,
    pub body_class_name: String,
    pub message_body_id: Option<Uuid>,
    pub leg_type: LegType,
    pub invocation: Invocation,
    pub leg_priority: LegPriority,
    pub status: HeaderStatus,
    pub is_error: bool,
    pub error_status: Option<String>,
    pub time_created: DateTime<Utc>,
    pub time_processed: Option<DateTime<Utc>>,
    pub description: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Protocol-specific indexed columns on `message_bodies` (§3.2). HL7 and
/// FHIR fields share one struct; unused fields stay `None`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BodyProtocolFields {
    pub schema_category: Option<String>,
    pub message_control_id: Option<String>,
    pub sending_application: Option<String>,
    pub sending_facility: Option<String>,
    pub fhir_version: Option<String>,
    pub fhir_resource_type: Option<String>,
    pub fhir_resource_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodyRow {
    pub id: Uuid,
    pub body_class_name: String,
    pub content_type: String,
    pub raw_content: Vec<u8>,
    pub content_size: i64,
    pub checksum: String,
    pub protocol_fields: BodyProtocolFields,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Production-level lifecycle (§3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductionState {
    Loaded,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostStatus {
    pub name: HostName,
    pub kind: HostKind,
    pub state: HostState,
    pub pool_size: u32,
    pub queue_len: usize,
    pub restart_count: u32,
}
