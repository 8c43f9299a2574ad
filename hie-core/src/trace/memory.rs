//! In-process `Trace` backend: default for tests and for deployments run
//! without a configured database. One `RwLock<Inner>` holding plain
//! collections, one lock acquisition per operation.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::TraceError;
use crate::types::{
    BodyProtocolFields, BodyRow, HeaderFields, HeaderRow, HeaderStatus, ProjectId,
};

use super::Trace;

struct Inner {
    bodies: HashMap<Uuid, BodyRow>,
    checksum_index: HashMap<String, Uuid>,
    headers: HashMap<Uuid, HeaderRow>,
    /// Monotonic counter per project backing `sequence_num` (P2).
    project_seq: HashMap<ProjectId, u64>,
}

pub struct MemoryTrace {
    inner: RwLock<Inner>,
    dedupe_bodies: bool,
}

impl MemoryTrace {
    pub fn new() -> Self {
        Self::with_dedup(true)
    }

    pub fn new_without_dedup() -> Self {
        Self::with_dedup(false)
    }

    fn with_dedup(dedupe_bodies: bool) -> Self {
        Self {
            inner: RwLock::new(Inner {
                bodies: HashMap::new(),
                checksum_index: HashMap::new(),
                headers: HashMap::new(),
                project_seq: HashMap::new(),
            }),
            dedupe_bodies,
        }
    }
}

impl Default for MemoryTrace {
    fn default() -> Self {
        Self::new()
    }
}

fn checksum_of(raw: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    hex::encode(hasher.finalize())
}

#[async_trait]
impl Trace for MemoryTrace {
    async fn store_body(
        &self,
        raw: Vec<u8>,
        body_class_name: &str,
        content_type: &str,
        protocol_fields: BodyProtocolFields,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Uuid, TraceError> {
        let checksum = checksum_of(&raw);
        let mut guard = self.inner.write().unwrap();
        if self.dedupe_bodies {
            if let Some(existing) = guard.checksum_index.get(&checksum) {
                return Ok(*existing);
            }
        }
        let id = Uuid::now_v7();
        let row = BodyRow {
            id,
            body_class_name: body_class_name.to_string(),
            content_type: content_type.to_string(),
            content_size: raw.len() as i64,
            raw_content: raw,
            checksum: checksum.clone(),
            protocol_fields,
            metadata: metadata.into_iter().collect(),
            created_at: Utc::now(),
        };
        guard.bodies.insert(id, row);
        if self.dedupe_bodies {
            guard.checksum_index.insert(checksum, id);
        }
        Ok(id)
    }

    async fn store_header(&self, fields: HeaderFields) -> Result<(Uuid, u64), TraceError> {
        let mut guard = self.inner.write().unwrap();
        let seq_counter = guard.project_seq.entry(fields.project_id.clone()).or_insert(0);
        *seq_counter += 1;
        let sequence_num = *seq_counter;
        let id = Uuid::now_v7();
        let row = HeaderRow {
            id,
            sequence_num,
            project_id: fields.project_id,
            session_id: fields.session_id,
            parent_header_id: fields.parent_header_id,
            corresponding_header_id: fields.corresponding_header_id,
            super_session_id: fields.super_session_id,
            source_config_name: fields.source_config_name,
            target_config_name: fields.target_config_name,
            source_business_type: fields.source_business_type,
            target_business_type: fields.target_business_type,
            message_type: fields.message_type,
            body_class_name: fields.body_class_name,
            message_body_id: fields.message_body_id,
            leg_type: fields.leg_type,
            invocation: fields.invocation,
            leg_priority: fields.leg_priority,
            status: HeaderStatus::Created,
            is_error: false,
            error_status: None,
            time_created: Utc::now(),
            time_processed: None,
            description: fields.description,
            metadata: fields.metadata,
        };
        guard.headers.insert(id, row);
        Ok((id, sequence_num))
    }

    async fn update_header_status(
        &self,
        header_id: Uuid,
        status: HeaderStatus,
        is_error: bool,
        error_status: Option<String>,
    ) -> Result<(), TraceError> {
        let mut guard = self.inner.write().unwrap();
        let row = guard
            .headers
            .get_mut(&header_id)
            .ok_or(TraceError::HeaderNotFound(header_id))?;
        if row.status.is_terminal() {
            // P8: terminal-status monotonicity -- silently a no-op rather
            // than a hard error, so a late duplicate update (e.g. a
            // raced Nack/Ack) never crashes a worker loop.
            return Err(TraceError::AlreadyTerminal(header_id));
        }
        row.status = status;
        row.is_error = is_error;
        row.error_status = error_status;
        if status.is_terminal() {
            row.time_processed = Some(Utc::now());
        }
        Ok(())
    }

    async fn trace_for_session(&self, session_id: &str) -> Result<Vec<HeaderRow>, TraceError> {
        let guard = self.inner.read().unwrap();
        let mut rows: Vec<HeaderRow> = guard
            .headers
            .values()
            .filter(|h| h.session_id == session_id)
            .cloned()
            .collect();
        rows.sort_by_key(|h| h.sequence_num);
        Ok(rows)
    }

    async fn get_header(&self, header_id: Uuid) -> Result<Option<HeaderRow>, TraceError> {
        Ok(self.inner.read().unwrap().headers.get(&header_id).cloned())
    }

    async fn get_body(&self, body_id: Uuid) -> Result<Option<BodyRow>, TraceError> {
        Ok(self.inner.read().unwrap().bodies.get(&body_id).cloned())
    }
}

impl MemoryTrace {
    /// Every stored header, ordered by `sequence_num`, across all sessions.
    /// Not part of `Trace` -- a test-only escape hatch for asserting on a
    /// whole production's trace without already knowing a `session_id`.
    pub fn all_headers(&self) -> Vec<HeaderRow> {
        let guard = self.inner.read().unwrap();
        let mut rows: Vec<HeaderRow> = guard.headers.values().cloned().collect();
        rows.sort_by_key(|h| h.sequence_num);
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BusinessType, Invocation, LegPriority, LegType};

    fn fields(project: &str, session: &str) -> HeaderFields {
        HeaderFields {
            project_id: project.to_string(),
            session_id: session.to_string(),
            parent_header_id: None,
            corresponding_header_id: None,
            super_session_id: None,
            source_config_name: "A".into(),
            target_config_name: "B".into(),
            source_business_type: BusinessType::Service,
            target_business_type: BusinessType::Process,
            message_type: "ADT^A01".into(),
            body_class_name: "hl7.v2".into(),
            message_body_id: None,
            leg_type: LegType::Request,
            invocation: Invocation::Queue,
            leg_priority: LegPriority::Async,
            description: String::new(),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn store_body_dedupes_by_checksum() {
        let trace = MemoryTrace::new();
        let a = trace
            .store_body(b"hello".to_vec(), "raw", "text/plain", Default::default(), Default::default())
            .await
            .unwrap();
        let b = trace
            .store_body(b"hello".to_vec(), "raw", "text/plain", Default::default(), Default::default())
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn store_body_without_dedup_inserts_twice() {
        let trace = MemoryTrace::new_without_dedup();
        let a = trace
            .store_body(b"hello".to_vec(), "raw", "text/plain", Default::default(), Default::default())
            .await
            .unwrap();
        let b = trace
            .store_body(b"hello".to_vec(), "raw", "text/plain", Default::default(), Default::default())
            .await
            .unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn sequence_num_is_monotonic_per_project() {
        let trace = MemoryTrace::new();
        let (_, s1) = trace.store_header(fields("p1", "s")).await.unwrap();
        let (_, s2) = trace.store_header(fields("p1", "s")).await.unwrap();
        assert!(s2 > s1);
    }

    #[tokio::test]
    async fn terminal_status_rejects_further_updates() {
        let trace = MemoryTrace::new();
        let (id, _) = trace.store_header(fields("p1", "s")).await.unwrap();
        trace
            .update_header_status(id, HeaderStatus::Completed, false, None)
            .await
            .unwrap();
        let err = trace
            .update_header_status(id, HeaderStatus::Error, true, Some("late".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, TraceError::AlreadyTerminal(_)));
    }

    #[tokio::test]
    async fn trace_for_session_orders_by_sequence_num() {
        let trace = MemoryTrace::new();
        trace.store_header(fields("p1", "sess-x")).await.unwrap();
        trace.store_header(fields("p1", "sess-x")).await.unwrap();
        trace.store_header(fields("p1", "sess-y")).await.unwrap();
        let rows = trace.trace_for_session("sess-x").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].sequence_num < rows[1].sequence_num);
    }
}
