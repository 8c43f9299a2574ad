//! Outbound operation host family (§4.4.3). Queue-backed like
//! `host::process`, but each envelope drives an outbound adapter `Send`
//! instead of a routing fan-out, and the response (or lack of one) is
//! classified through the operation's reply-code-action table
//! (`hl7::reply_code`) instead of being unconditionally completed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use uuid::Uuid;

use crate::adapter::{OutboundAdapter, OutboundFrame};
use crate::error::{AdapterError, HostError};
use crate::hl7;
use crate::hl7::reply_code::{Action, Classifier};
use crate::registry::ServiceRegistry;
use crate::trace::Trace;
use crate::types::{
    BodyProtocolFields, BusinessType, Envelope, HeaderFields, HeaderStatus, HostKind, HostState,
    HostStatus, Invocation, LegPriority, LegType,
};

use super::{Host, HostConfig, HostContext, HostLogic, Outcome, WorkerPool};

/// `~` stands in for "no acknowledgement received at all" -- a transport
/// failure classified the same way a malformed/missing MSA would be
/// (`hl7::reply_code`'s opaque-pattern note).
const NO_ACK: &str = "~";

struct OperationLogic {
    project_id: String,
    protocol_is_hl7: bool,
    adapter: Arc<dyn OutboundAdapter>,
    /// Label for the external system the adapter talks to (peer address/URL/
    /// path) -- it isn't a configured host, so it has no registry entry to
    /// look a business type up from; this is what stands in for it as the
    /// external leg's `source`/`target_config_name` (§8.2 S1 legs 4-7).
    peer_label: String,
    classifier: Classifier,
    retry_interval: Duration,
    failure_timeout: Duration,
    disable_signal: watch::Sender<HostState>,
}

impl OperationLogic {
    /// Record the outbound Request leg (host -> external peer) before the
    /// adapter `Send`, parented on the envelope's own leg (§8.2 S1 leg 4/6).
    async fn store_request(&self, ctx: &HostContext, env: &Envelope) -> Result<Uuid, HostError> {
        let (header_id, _seq) = ctx
            .trace
            .store_header(HeaderFields {
                project_id: self.project_id.clone(),
                session_id: env.session_id.clone(),
                parent_header_id: Some(env.header_id),
                corresponding_header_id: None,
                super_session_id: None,
                source_config_name: ctx.host_name.clone(),
                target_config_name: self.peer_label.clone(),
                source_business_type: BusinessType::Operation,
                target_business_type: BusinessType::External,
                message_type: env.body_class_name.clone(),
                body_class_name: env.body_class_name.clone(),
                message_body_id: None,
                leg_type: LegType::Request,
                invocation: Invocation::Queue,
                leg_priority: LegPriority::Async,
                description: String::new(),
                metadata: HashMap::new(),
            })
            .await?;
        Ok(header_id)
    }

    /// Record the Response leg (external peer -> host), corresponding to the
    /// Request leg just sent (§8.2 S1 leg 5/7), and deliver it to whichever
    /// `SyncReliable` waiter (if any) is blocked on `env.header_id`.
    async fn store_response(
        &self,
        ctx: &HostContext,
        env: &Envelope,
        request_header_id: Uuid,
        response: Vec<u8>,
    ) -> Result<(), HostError> {
        let protocol_fields = if self.protocol_is_hl7 {
            match hl7::parse_msh(&response) {
                Some(msh) => BodyProtocolFields {
                    message_control_id: Some(msh.control_id),
                    sending_application: Some(msh.sending_application),
                    sending_facility: Some(msh.sending_facility),
                    ..Default::default()
                },
                None => BodyProtocolFields::default(),
            }
        } else {
            BodyProtocolFields::default()
        };

        let body_id = ctx
            .trace
            .store_body(response, &env.body_class_name, &env.content_type, protocol_fields, serde_json::Map::new())
            .await?;

        let (header_id, _seq) = ctx
            .trace
            .store_header(HeaderFields {
                project_id: self.project_id.clone(),
                session_id: env.session_id.clone(),
                parent_header_id: Some(request_header_id),
                corresponding_header_id: Some(request_header_id),
                super_session_id: None,
                source_config_name: self.peer_label.clone(),
                target_config_name: ctx.host_name.clone(),
                source_business_type: BusinessType::External,
                target_business_type: BusinessType::Operation,
                message_type: env.body_class_name.clone(),
                body_class_name: env.body_class_name.clone(),
                message_body_id: Some(body_id),
                leg_type: LegType::Response,
                invocation: Invocation::Queue,
                leg_priority: LegPriority::Async,
                description: String::new(),
                metadata: HashMap::new(),
            })
            .await?;
        let _ = ctx.trace.update_header_status(header_id, HeaderStatus::Completed, false, None).await;

        let response_env = env.derive_for_leg(ctx.host_name.clone(), header_id);
        ctx.registry.deliver_response(env.header_id, response_env).await;
        Ok(())
    }

    /// Map a classified action to the generic worker-loop outcome, pausing
    /// the host first when the action is `Disable` (§4.4.3 step 4).
    fn outcome_for_action(&self, action: Action, detail: String) -> Outcome {
        match action {
            Action::Complete => Outcome::Completed,
            Action::Warning => {
                warn!(detail, "operation reply classified as Warning, treating as completed");
                Outcome::Completed
            }
            Action::Suspend => Outcome::Retry,
            Action::Fail => Outcome::Failed { error_status: detail },
            Action::Disable => {
                let _ = self.disable_signal.send(HostState::Paused);
                Outcome::Failed { error_status: detail }
            }
        }
    }
}

#[async_trait]
impl HostLogic for OperationLogic {
    async fn process(&self, env: Envelope, ctx: &HostContext) -> Result<Outcome, HostError> {
        let frame = OutboundFrame {
            raw: env.raw.clone(),
            message_type: env.body_class_name.clone(),
            id: env.message_id.to_string(),
        };

        let request_header_id = self.store_request(ctx, &env).await?;

        match self.adapter.send(frame).await {
            Ok(response) => {
                let code = if self.protocol_is_hl7 {
                    hl7::parse_msa_code(&response)
                } else {
                    None
                };
                let classified = code.and_then(|c| self.classifier.classify(&c).map(|action| (action, c)));
                let _ = ctx
                    .trace
                    .update_header_status(request_header_id, HeaderStatus::Completed, false, None)
                    .await;
                self.store_response(ctx, &env, request_header_id, response).await?;
                match classified {
                    Some((action, code)) => Ok(self.outcome_for_action(action, code)),
                    None => Ok(Outcome::Completed),
                }
            }
            Err(adapter_err) => {
                let detail = adapter_err.to_string();
                let action = self
                    .classifier
                    .classify(NO_ACK)
                    .unwrap_or(default_action_for(&adapter_err));
                let _ = ctx
                    .trace
                    .update_header_status(request_header_id, HeaderStatus::Error, true, Some(detail.clone()))
                    .await;
                if action == Action::Suspend {
                    tokio::time::sleep(self.retry_interval.min(self.failure_timeout)).await;
                }
                Ok(self.outcome_for_action(action, detail))
            }
        }
    }
}

fn default_action_for(err: &AdapterError) -> Action {
    match err {
        AdapterError::Transient(_) | AdapterError::Timeout => Action::Suspend,
        AdapterError::Permanent(_) | AdapterError::MalformedFrame(_) => Action::Fail,
    }
}

pub struct OperationHost {
    pool: WorkerPool,
}

impl OperationHost {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: HostConfig,
        project_id: String,
        protocol_is_hl7: bool,
        adapter: Arc<dyn OutboundAdapter>,
        peer_label: String,
        reply_code_actions: &str,
        retry_interval: Duration,
        failure_timeout: Duration,
        registry: Arc<ServiceRegistry>,
        trace: Arc<dyn Trace>,
    ) -> Result<Self, crate::error::ConfigError> {
        let classifier = Classifier::parse(reply_code_actions)
            .map_err(|e| crate::error::ConfigError::MalformedReplyCodeActions(reply_code_actions.to_string(), e))?;
        let ctx = HostContext {
            host_name: config.name.clone(),
            registry,
            trace,
            target_config_names: config.target_config_names.clone(),
        };
        // Built outside `WorkerPool::new` so `OperationLogic` can hold its
        // own sender clone and pause its own host on a `Disable` action
        // (§4.4.3 step 4) without reaching back through `HostContext`.
        let (state_tx, state_rx) = watch::channel(HostState::Created);
        let logic = Arc::new(OperationLogic {
            project_id,
            protocol_is_hl7,
            adapter,
            peer_label,
            classifier,
            retry_interval,
            failure_timeout,
            disable_signal: state_tx.clone(),
        });
        let pool = WorkerPool::with_state_channel(config, logic, ctx, state_tx, state_rx);
        Ok(Self { pool })
    }
}

#[async_trait]
impl Host for OperationHost {
    fn name(&self) -> &str {
        self.pool.name()
    }

    fn kind(&self) -> HostKind {
        HostKind::Operation
    }

    fn status(&self) -> HostStatus {
        self.pool.status(HostKind::Operation)
    }

    async fn start(&self, cancel: CancellationToken) -> Result<(), HostError> {
        self.pool.start(cancel).await
    }

    async fn stop(&self) -> Result<(), HostError> {
        self.pool.stop(Duration::from_secs(30)).await
    }

    async fn pause(&self) -> Result<(), HostError> {
        self.pool.pause().await
    }

    async fn resume(&self) -> Result<(), HostError> {
        self.pool.resume().await
    }

    async fn enqueue(&self, env: Envelope) -> Result<(), HostError> {
        self.pool.enqueue(env).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::MemoryTrace;
    use crate::types::{ExecutionMode, OverflowPolicy, QueueType, RestartPolicy};
    use tokio::sync::Mutex;

    struct StubAdapter {
        response: Mutex<Option<Result<Vec<u8>, AdapterError>>>,
    }

    #[async_trait]
    impl OutboundAdapter for StubAdapter {
        async fn send(&self, _frame: OutboundFrame) -> Result<Vec<u8>, AdapterError> {
            self.response
                .lock()
                .await
                .take()
                .unwrap_or(Err(AdapterError::Transient("no response queued".into())))
        }
    }

    fn ctx() -> HostContext {
        HostContext {
            host_name: "Lab-Out".into(),
            registry: Arc::new(ServiceRegistry::new()),
            trace: Arc::new(MemoryTrace::new()),
            target_config_names: vec![],
        }
    }

    fn env() -> Envelope {
        Envelope::new_session(
            "Lab-Process",
            b"MSH|^~\\&|EPR|HOSP|LAB|HOSP|20260213101500||ORU^R01|0002|P|2.4\r".to_vec(),
            "application/hl7-v2",
            "ORU^R01",
            uuid::Uuid::now_v7(),
            uuid::Uuid::now_v7(),
        )
    }

    fn logic(adapter: Arc<StubAdapter>, reply_code_actions: &str) -> OperationLogic {
        let (state_tx, _state_rx) = watch::channel(HostState::Created);
        OperationLogic {
            project_id: "proj".into(),
            protocol_is_hl7: true,
            adapter,
            peer_label: "10.0.0.9:6662".into(),
            classifier: Classifier::parse(reply_code_actions).unwrap(),
            retry_interval: Duration::from_millis(1),
            failure_timeout: Duration::from_millis(5),
            disable_signal: state_tx,
        }
    }

    #[tokio::test]
    async fn aa_ack_classifies_as_completed() {
        let adapter = Arc::new(StubAdapter {
            response: Mutex::new(Some(Ok(b"MSH|^~\\&|LAB|HOSP|EPR|HOSP|20260213101501||ACK|9001|P|2.4\rMSA|AA|0002\r".to_vec()))),
        });
        let logic = logic(adapter, "*=C");
        let outcome = logic.process(env(), &ctx()).await.unwrap();
        assert!(matches!(outcome, Outcome::Completed));
    }

    #[tokio::test]
    async fn ae_ack_classifies_as_failed() {
        let adapter = Arc::new(StubAdapter {
            response: Mutex::new(Some(Ok(b"MSH|^~\\&|LAB|HOSP|EPR|HOSP|20260213101501||ACK|9001|P|2.4\rMSA|AE|0002\r".to_vec()))),
        });
        let logic = logic(adapter, "AA=C,AE=F,*=S");
        let outcome = logic.process(env(), &ctx()).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed { .. }));
    }

    #[tokio::test]
    async fn transport_failure_with_no_ack_rule_suspends_for_retry() {
        let adapter = Arc::new(StubAdapter {
            response: Mutex::new(Some(Err(AdapterError::Transient("connection reset".into())))),
        });
        let logic = logic(adapter, "~=S,*=F");
        let outcome = logic.process(env(), &ctx()).await.unwrap();
        assert!(matches!(outcome, Outcome::Retry));
    }

    #[tokio::test]
    async fn disable_action_pauses_the_host_via_shared_state_channel() {
        let adapter = Arc::new(StubAdapter {
            response: Mutex::new(Some(Ok(b"MSH|^~\\&|LAB|HOSP|EPR|HOSP|20260213101501||ACK|9001|P|2.4\rMSA|AR|0002\r".to_vec()))),
        });
        let (state_tx, state_rx) = watch::channel(HostState::Running);
        let logic = OperationLogic {
            project_id: "proj".into(),
            protocol_is_hl7: true,
            adapter,
            peer_label: "10.0.0.9:6662".into(),
            classifier: Classifier::parse("AR=D,*=S").unwrap(),
            retry_interval: Duration::from_millis(1),
            failure_timeout: Duration::from_millis(5),
            disable_signal: state_tx,
        };
        let outcome = logic.process(env(), &ctx()).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed { .. }));
        assert_eq!(*state_rx.borrow(), HostState::Paused);
    }

    #[tokio::test]
    async fn operation_host_reports_operation_kind() {
        let config = HostConfig {
            name: "Lab-Out".into(),
            class_name: "engine.hl7.Operation".into(),
            pool_size: 1,
            execution_mode: ExecutionMode::Cooperative,
            queue_type: QueueType::Fifo,
            queue_size: 8,
            overflow_strategy: OverflowPolicy::Block,
            restart_policy: RestartPolicy::OnFailure,
            max_restarts: 3,
            restart_delay: Duration::from_millis(10),
            messaging_pattern: crate::types::MessagingPattern::AsyncReliable,
            message_timeout: Duration::from_secs(5),
            max_retries: 3,
            target_config_names: vec![],
        };
        let adapter = Arc::new(StubAdapter {
            response: Mutex::new(None),
        });
        let host = OperationHost::new(
            config,
            "proj".into(),
            true,
            adapter,
            "10.0.0.9:6662".into(),
            "*=C",
            Duration::from_millis(1),
            Duration::from_millis(5),
            Arc::new(ServiceRegistry::new()),
            Arc::new(MemoryTrace::new()),
        )
        .unwrap();
        assert_eq!(host.kind(), HostKind::Operation);
    }

    #[tokio::test]
    async fn successful_send_records_request_and_response_legs() {
        let adapter = Arc::new(StubAdapter {
            response: Mutex::new(Some(Ok(b"MSH|^~\\&|LAB|HOSP|EPR|HOSP|20260213101501||ACK|9001|P|2.4\rMSA|AA|0002\r".to_vec()))),
        });
        let logic = logic(adapter, "*=C");
        let trace = Arc::new(MemoryTrace::new());
        let ctx = HostContext {
            host_name: "Lab-Out".into(),
            registry: Arc::new(ServiceRegistry::new()),
            trace: trace.clone(),
            target_config_names: vec![],
        };
        let env = env();
        let session_id = env.session_id.clone();
        let outcome = logic.process(env, &ctx).await.unwrap();
        assert!(matches!(outcome, Outcome::Completed));

        let rows = trace.trace_for_session(&session_id).await.unwrap();
        assert_eq!(rows.len(), 2, "expected a Request leg and a Response leg");

        let request = &rows[0];
        assert_eq!(request.source_config_name, "Lab-Out");
        assert_eq!(request.target_config_name, "10.0.0.9:6662");
        assert_eq!(request.source_business_type, BusinessType::Operation);
        assert_eq!(request.target_business_type, BusinessType::External);
        assert!(matches!(request.leg_type, LegType::Request));
        assert!(matches!(request.status, crate::types::HeaderStatus::Completed));

        let response = &rows[1];
        assert_eq!(response.source_config_name, "10.0.0.9:6662");
        assert_eq!(response.target_config_name, "Lab-Out");
        assert_eq!(response.source_business_type, BusinessType::External);
        assert_eq!(response.target_business_type, BusinessType::Operation);
        assert!(matches!(response.leg_type, LegType::Response));
        assert_eq!(response.parent_header_id, Some(request.id));
        assert_eq!(response.corresponding_header_id, Some(request.id));
    }

    #[tokio::test]
    async fn transport_failure_marks_request_leg_as_error() {
        let adapter = Arc::new(StubAdapter {
            response: Mutex::new(Some(Err(AdapterError::Permanent("refused".into())))),
        });
        let logic = logic(adapter, "*=F");
        let trace = Arc::new(MemoryTrace::new());
        let ctx = HostContext {
            host_name: "Lab-Out".into(),
            registry: Arc::new(ServiceRegistry::new()),
            trace: trace.clone(),
            target_config_names: vec![],
        };
        let env = env();
        let session_id = env.session_id.clone();
        let outcome = logic.process(env, &ctx).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed { .. }));

        let rows = trace.trace_for_session(&session_id).await.unwrap();
        assert_eq!(rows.len(), 1, "no response arrived, so only the Request leg exists");
        assert!(matches!(rows[0].status, crate::types::HeaderStatus::Error));
        assert!(rows[0].is_error);
    }
}
