//! PostgreSQL-backed `Trace`: raw `sqlx::query()` (not the `query!` macro),
//! manual `row.get::<T>(..)` extraction, and a monotonic-sequence CTE keyed
//! on `project_id` for `sequence_num` assignment.

use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use crate::error::TraceError;
use crate::types::{BodyProtocolFields, BodyRow, HeaderFields, HeaderRow, HeaderStatus};

use super::Trace;

pub struct PostgresTrace {
    pool: sqlx::PgPool,
    dedupe_bodies: bool,
}

impl PostgresTrace {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            dedupe_bodies: true,
        }
    }

    pub fn new_without_dedup(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            dedupe_bodies: false,
        }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn status_str(s: HeaderStatus) -> &'static str {
    match s {
        HeaderStatus::Created => "created",
        HeaderStatus::Queued => "queued",
        HeaderStatus::Delivered => "delivered",
        HeaderStatus::Completed => "completed",
        HeaderStatus::Error => "error",
        HeaderStatus::Discarded => "discarded",
    }
}

fn status_from_str(s: &str) -> HeaderStatus {
    match s {
        "queued" => HeaderStatus::Queued,
        "delivered" => HeaderStatus::Delivered,
        "completed" => HeaderStatus::Completed,
        "error" => HeaderStatus::Error,
        "discarded" => HeaderStatus::Discarded,
        _ => HeaderStatus::Created,
    }
}

fn row_to_header(row: &sqlx::postgres::PgRow) -> Result<HeaderRow, TraceError> {
    use crate::types::{BusinessType, Invocation, LegPriority, LegType};
    let business_type = |s: &str| match s {
        "process" => BusinessType::Process,
        "operation" => BusinessType::Operation,
        "external" => BusinessType::External,
        _ => BusinessType::Service,
    };
    let metadata: serde_json::Value = row.try_get("metadata").map_err(anyhow::Error::from)?;
    Ok(HeaderRow {
        id: row.try_get("id").map_err(anyhow::Error::from)?,
        sequence_num: row.try_get::<i64, _>("sequence_num").map_err(anyhow::Error::from)? as u64,
        project_id: row.try_get("project_id").map_err(anyhow::Error::from)?,
        session_id: row.try_get("session_id").map_err(anyhow::Error::from)?,
        parent_header_id: row.try_get("parent_header_id").map_err(anyhow::Error::from)?,
        corresponding_header_id: row
            .try_get("corresponding_header_id")
            .map_err(anyhow::Error::from)?,
        super_session_id: row.try_get("super_session_id").map_err(anyhow::Error::from)?,
        source_config_name: row.try_get("source_config_name").map_err(anyhow::Error::from)?,
        target_config_name: row.try_get("target_config_name").map_err(anyhow::Error::from)?,
        source_business_type: business_type(
            &row.try_get::<String, _>("source_business_type")
                .map_err(anyhow::Error::from)?,
        ),
        target_business_type: business_type(
            &row.try_get::<String, _>("target_business_type")
                .map_err(anyhow::Error::from)?,
        ),
        message_type: row.try_get("message_type").map_err(anyhow::Error::from)?,
        body_class_name: row.try_get("body_class_name").map_err(anyhow::Error::from)?,
        message_body_id: row.try_get("message_body_id").map_err(anyhow::Error::from)?,
        leg_type: if row.try_get::<String, _>("leg_type").map_err(anyhow::Error::from)? == "response" {
            LegType::Response
        } else {
            LegType::Request
        },
        invocation: if row.try_get::<String, _>("invocation").map_err(anyhow::Error::from)? == "in_proc" {
            Invocation::InProc
        } else {
            Invocation::Queue
        },
        leg_priority: if row.try_get::<String, _>("leg_priority").map_err(anyhow::Error::from)? == "sync" {
            LegPriority::Sync
        } else {
            LegPriority::Async
        },
        status: status_from_str(&row.try_get::<String, _>("status").map_err(anyhow::Error::from)?),
        is_error: row.try_get("is_error").map_err(anyhow::Error::from)?,
        error_status: row.try_get("error_status").map_err(anyhow::Error::from)?,
        time_created: row.try_get("time_created").map_err(anyhow::Error::from)?,
        time_processed: row.try_get("time_processed").map_err(anyhow::Error::from)?,
        description: row.try_get("description").map_err(anyhow::Error::from)?,
        metadata: serde_json::from_value(metadata).unwrap_or_default(),
    })
}

#[async_trait]
impl Trace for PostgresTrace {
    async fn store_body(
        &self,
        raw: Vec<u8>,
        body_class_name: &str,
        content_type: &str,
        protocol_fields: BodyProtocolFields,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Uuid, TraceError> {
        use sha2::{Digest, Sha256};
        let checksum = hex::encode(Sha256::digest(&raw));

        if self.dedupe_bodies {
            let existing = sqlx::query("SELECT id FROM message_bodies WHERE checksum = $1")
                .bind(&checksum)
                .fetch_optional(&self.pool)
                .await
                .map_err(anyhow::Error::from)?;
            if let Some(row) = existing {
                return Ok(row.try_get("id").map_err(anyhow::Error::from)?);
            }
        }

        let id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO message_bodies
                (id, body_class_name, content_type, raw_content, content_size, checksum,
                 schema_category, message_control_id, sending_application, sending_facility,
                 fhir_version, fhir_resource_type, fhir_resource_id, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, now())
            "#,
        )
        .bind(id)
        .bind(body_class_name)
        .bind(content_type)
        .bind(&raw)
        .bind(raw.len() as i64)
        .bind(&checksum)
        .bind(protocol_fields.schema_category)
        .bind(protocol_fields.message_control_id)
        .bind(protocol_fields.sending_application)
        .bind(protocol_fields.sending_facility)
        .bind(protocol_fields.fhir_version)
        .bind(protocol_fields.fhir_resource_type)
        .bind(protocol_fields.fhir_resource_id)
        .bind(serde_json::Value::Object(metadata))
        .execute(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        Ok(id)
    }

    async fn store_header(&self, fields: HeaderFields) -> Result<(Uuid, u64), TraceError> {
        let id = Uuid::now_v7();
        let row = sqlx::query(
            r#"
            WITH seq AS (
                INSERT INTO project_sequences (project_id, next_seq)
                VALUES ($1, 1)
                ON CONFLICT (project_id) DO UPDATE
                    SET next_seq = project_sequences.next_seq + 1
                RETURNING next_seq
            )
            INSERT INTO message_headers
                (id, sequence_num, project_id, session_id, parent_header_id,
                 corresponding_header_id, super_session_id, source_config_name,
                 target_config_name, source_business_type, target_business_type,
                 message_type, body_class_name, message_body_id, leg_type, invocation,
                 leg_priority, status, is_error, error_status, time_created, time_processed,
                 description, metadata)
            SELECT $2, seq.next_seq, $1, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                   $15, $16, 'created', false, NULL, now(), NULL, $17, $18
            FROM seq
            RETURNING sequence_num
            "#,
        )
        .bind(&fields.project_id)
        .bind(id)
        .bind(&fields.session_id)
        .bind(fields.parent_header_id)
        .bind(fields.corresponding_header_id)
        .bind(&fields.super_session_id)
        .bind(&fields.source_config_name)
        .bind(&fields.target_config_name)
        .bind(format!("{:?}", fields.source_business_type).to_lowercase())
        .bind(format!("{:?}", fields.target_business_type).to_lowercase())
        .bind(&fields.message_type)
        .bind(&fields.body_class_name)
        .bind(fields.message_body_id)
        .bind(if matches!(fields.leg_type, crate::types::LegType::Response) {
            "response"
        } else {
            "request"
        })
        .bind(if matches!(fields.invocation, crate::types::Invocation::InProc) {
            "in_proc"
        } else {
            "queue"
        })
        .bind(if matches!(fields.leg_priority, crate::types::LegPriority::Sync) {
            "sync"
        } else {
            "async"
        })
        .bind(&fields.description)
        .bind(serde_json::to_value(&fields.metadata).unwrap_or(serde_json::json!({})))
        .fetch_one(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        let seq: i64 = row.try_get("sequence_num").map_err(anyhow::Error::from)?;
        Ok((id, seq as u64))
    }

    async fn update_header_status(
        &self,
        header_id: Uuid,
        status: HeaderStatus,
        is_error: bool,
        error_status: Option<String>,
    ) -> Result<(), TraceError> {
        let result = sqlx::query(
            r#"
            UPDATE message_headers
            SET status = $2, is_error = $3, error_status = $4,
                time_processed = CASE WHEN $2 IN ('completed', 'error', 'discarded') THEN now() ELSE time_processed END
            WHERE id = $1
              AND status NOT IN ('completed', 'error', 'discarded')
            "#,
        )
        .bind(header_id)
        .bind(status_str(status))
        .bind(is_error)
        .bind(error_status)
        .execute(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        if result.rows_affected() == 0 {
            return Err(TraceError::AlreadyTerminal(header_id));
        }
        Ok(())
    }

    async fn trace_for_session(&self, session_id: &str) -> Result<Vec<HeaderRow>, TraceError> {
        let rows = sqlx::query("SELECT * FROM message_headers WHERE session_id = $1 ORDER BY sequence_num ASC")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;
        rows.iter().map(row_to_header).collect()
    }

    async fn get_header(&self, header_id: Uuid) -> Result<Option<HeaderRow>, TraceError> {
        let row = sqlx::query("SELECT * FROM message_headers WHERE id = $1")
            .bind(header_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;
        row.as_ref().map(row_to_header).transpose()
    }

    async fn get_body(&self, body_id: Uuid) -> Result<Option<BodyRow>, TraceError> {
        let row = sqlx::query("SELECT * FROM message_bodies WHERE id = $1")
            .bind(body_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;
        let Some(row) = row else { return Ok(None) };
        let metadata: serde_json::Value = row.try_get("metadata").map_err(anyhow::Error::from)?;
        Ok(Some(BodyRow {
            id: row.try_get("id").map_err(anyhow::Error::from)?,
            body_class_name: row.try_get("body_class_name").map_err(anyhow::Error::from)?,
            content_type: row.try_get("content_type").map_err(anyhow::Error::from)?,
            raw_content: row.try_get("raw_content").map_err(anyhow::Error::from)?,
            content_size: row.try_get("content_size").map_err(anyhow::Error::from)?,
            checksum: row.try_get("checksum").map_err(anyhow::Error::from)?,
            protocol_fields: BodyProtocolFields {
                schema_category: row.try_get("schema_category").map_err(anyhow::Error::from)?,
                message_control_id: row.try_get("message_control_id").map_err(anyhow::Error::from)?,
                sending_application: row.try_get("sending_application").map_err(anyhow::Error::from)?,
                sending_facility: row.try_get("sending_facility").map_err(anyhow::Error::from)?,
                fhir_version: row.try_get("fhir_version").map_err(anyhow::Error::from)?,
                fhir_resource_type: row.try_get("fhir_resource_type").map_err(anyhow::Error::from)?,
                fhir_resource_id: row.try_get("fhir_resource_id").map_err(anyhow::Error::from)?,
            },
            metadata: serde_json::from_value(metadata).unwrap_or_default(),
            created_at: row.try_get("created_at").map_err(anyhow::Error::from)?,
        }))
    }
}
