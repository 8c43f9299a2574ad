//! Inbound service host family (§4.4.1): adapter-driven, not queue-driven.
//! Each accepted frame is handled inline by whichever adapter connection/
//! task received it -- concurrency comes from the adapter parallelising
//! connections, not from a worker pool pulling off a queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapter::{FrameHandler, FrameMeta};
use crate::error::{AdapterError, HostError, RegistryError};
use crate::hl7;
use crate::registry::ServiceRegistry;
use crate::trace::Trace;
use crate::types::{
    BodyProtocolFields, BusinessType, Envelope, HeaderFields, HostKind, HostState, HostStatus,
    Invocation, LegPriority, LegType, MessagingPattern,
};

use super::Host;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    App,
    Immediate,
    Never,
}

/// Which frame schema this service parses before storing the body
/// (`host.*` config keys, §6.2). `Raw` stores the frame unparsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Hl7,
    Raw,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub project_id: String,
    pub protocol: Protocol,
    pub message_schema_category: String,
    pub target_config_names: Vec<String>,
    pub ack_mode: AckMode,
    pub use_ack_commit_codes: bool,
    pub messaging_pattern: MessagingPattern,
    pub send_timeout: Duration,
}

pub struct ServiceHost {
    config: ServiceConfig,
    registry: Arc<ServiceRegistry>,
    trace: Arc<dyn Trace>,
    state_tx: watch::Sender<HostState>,
    state_rx: watch::Receiver<HostState>,
}

impl ServiceHost {
    pub fn new(config: ServiceConfig, registry: Arc<ServiceRegistry>, trace: Arc<dyn Trace>) -> Self {
        let (state_tx, state_rx) = watch::channel(HostState::Created);
        Self {
            config,
            registry,
            trace,
            state_tx,
            state_rx,
        }
    }

    /// Invoked by the owning adapter for each accepted frame (§4.1 inbound
    /// contract's `onFrame`). Returns the reply bytes (possibly empty).
    pub async fn handle_frame(&self, raw: Vec<u8>) -> Result<Vec<u8>, HostError> {
        if *self.state_rx.borrow() != HostState::Running {
            return Err(HostError::Registry(RegistryError::Unavailable(self.config.name.clone())));
        }

        let session_id = format!("SES-{}", Uuid::now_v7());

        let (protocol_fields, message_type, msh) = match self.config.protocol {
            Protocol::Hl7 => match hl7::parse_msh(&raw) {
                Some(msh) => (
                    BodyProtocolFields {
                        schema_category: Some(self.config.message_schema_category.clone()),
                        message_control_id: Some(msh.control_id.clone()),
                        sending_application: Some(msh.sending_application.clone()),
                        sending_facility: Some(msh.sending_facility.clone()),
                        ..Default::default()
                    },
                    msh.message_type_display(),
                    Some(msh),
                ),
                None => {
                    warn!(host = %self.config.name, "malformed HL7 frame, no MSH segment");
                    return Ok(Vec::new());
                }
            },
            Protocol::Raw => (BodyProtocolFields::default(), String::new(), None),
        };

        let body_id = self
            .trace
            .store_body(
                raw.clone(),
                "hl7.v2.er7",
                "application/hl7-v2",
                protocol_fields,
                serde_json::Map::new(),
            )
            .await
            .map_err(|e| HostError::Trace(e))?;

        for target in &self.config.target_config_names {
            let (header_id, _seq) = self
                .trace
                .store_header(HeaderFields {
                    project_id: self.config.project_id.clone(),
                    session_id: session_id.clone(),
                    parent_header_id: None,
                    corresponding_header_id: None,
                    super_session_id: None,
                    source_config_name: self.config.name.clone(),
                    target_config_name: target.clone(),
                    source_business_type: BusinessType::Service,
                    target_business_type: BusinessType::Process,
                    message_type: message_type.clone(),
                    body_class_name: "hl7.v2.er7".to_string(),
                    message_body_id: Some(body_id),
                    leg_type: LegType::Request,
                    invocation: Invocation::Queue,
                    leg_priority: LegPriority::Async,
                    description: String::new(),
                    metadata: HashMap::new(),
                })
                .await
                .map_err(|e| HostError::Trace(e))?;

            let env = Envelope::new_session(
                self.config.name.clone(),
                raw.clone(),
                "application/hl7-v2",
                "hl7.v2.er7",
                header_id,
                body_id,
            );
            let mut env = env;
            env.session_id = session_id.clone();
            env.destination = Some(target.clone());

            if let Err(e) = self
                .registry
                .send(target, env, self.config.messaging_pattern, self.config.send_timeout)
                .await
            {
                warn!(host = %self.config.name, target, error = %e, "failed to dispatch to target");
            }
        }

        if self.config.ack_mode == AckMode::Never {
            return Ok(Vec::new());
        }
        match msh {
            Some(msh) => Ok(hl7::build_ack(&msh, hl7::AckCode::Aa, &Uuid::now_v7().as_simple().to_string())),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl Host for ServiceHost {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> HostKind {
        HostKind::Service
    }

    fn status(&self) -> HostStatus {
        HostStatus {
            name: self.config.name.clone(),
            kind: HostKind::Service,
            state: *self.state_rx.borrow(),
            pool_size: 1,
            queue_len: 0,
            restart_count: 0,
        }
    }

    async fn start(&self, _cancel: CancellationToken) -> Result<(), HostError> {
        let _ = self.state_tx.send(HostState::Running);
        info!(host = %self.config.name, "service host running");
        Ok(())
    }

    async fn stop(&self) -> Result<(), HostError> {
        let _ = self.state_tx.send(HostState::Stopped);
        Ok(())
    }

    async fn pause(&self) -> Result<(), HostError> {
        let _ = self.state_tx.send(HostState::Paused);
        Ok(())
    }

    async fn resume(&self) -> Result<(), HostError> {
        let _ = self.state_tx.send(HostState::Running);
        Ok(())
    }

    /// Services aren't queue-backed; the adapter drives them via
    /// `handle_frame` instead.
    async fn enqueue(&self, _env: Envelope) -> Result<(), HostError> {
        Err(HostError::Registry(RegistryError::Unavailable(self.config.name.clone())))
    }
}

/// Lets an inbound adapter drive this host directly (`classes::builtin_registry`'s
/// service factory binds the two together at deploy time).
#[async_trait]
impl FrameHandler for ServiceHost {
    async fn handle_frame(&self, raw: Vec<u8>, _meta: FrameMeta) -> Result<Vec<u8>, AdapterError> {
        self.handle_frame(raw).await.map_err(|e| AdapterError::Transient(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::MemoryTrace;

    fn s1_frame() -> Vec<u8> {
        b"MSH|^~\\&|PAS|HOSP|EPR|HOSP|20260213101500||ADT^A01|0001|P|2.4\rEVN||20260213101500\rPID|||NHS-1||SMITH^JOHN||19800101|M\r".to_vec()
    }

    fn host(targets: Vec<String>) -> (ServiceHost, Arc<ServiceRegistry>) {
        let registry = Arc::new(ServiceRegistry::new());
        let trace = Arc::new(MemoryTrace::new());
        let config = ServiceConfig {
            name: "PAS-In".into(),
            project_id: "proj".into(),
            protocol: Protocol::Hl7,
            message_schema_category: "hl7".into(),
            target_config_names: targets,
            ack_mode: AckMode::Immediate,
            use_ack_commit_codes: false,
            messaging_pattern: MessagingPattern::AsyncReliable,
            send_timeout: Duration::from_secs(5),
        };
        (ServiceHost::new(config, registry.clone(), trace), registry)
    }

    #[tokio::test]
    async fn handle_frame_returns_aa_ack_when_no_targets() {
        let (host, _registry) = host(vec![]);
        host.start(CancellationToken::new()).await.unwrap();
        let reply = host.handle_frame(s1_frame()).await.unwrap();
        let text = String::from_utf8(reply).unwrap();
        assert!(text.contains("MSA|AA|0001"));
    }

    #[tokio::test]
    async fn handle_frame_rejects_malformed_frame_with_empty_reply() {
        let (host, _registry) = host(vec![]);
        host.start(CancellationToken::new()).await.unwrap();
        let reply = host.handle_frame(b"PID|||1\r".to_vec()).await.unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn handle_frame_fails_when_not_running() {
        let (host, _registry) = host(vec![]);
        let err = host.handle_frame(s1_frame()).await.unwrap_err();
        assert!(matches!(err, HostError::Registry(RegistryError::Unavailable(_))));
    }
}
