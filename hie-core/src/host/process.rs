//! Routing process host family (§4.4.2). No adapter; receives envelopes
//! from its queue and fans them out to targets chosen by a pluggable
//! `RoutingRule`. The rule engine itself (DTL/business-rule language) is
//! out of scope (§1); this core ships one built-in rule, static fan-out to
//! the host's configured `target_config_names`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::HostError;
use crate::registry::ServiceRegistry;
use crate::trace::Trace;
use crate::types::{
    BusinessType, Envelope, HeaderFields, HostKind, HostStatus, Invocation, LegPriority, LegType,
    MessagingPattern,
};

use super::{Host, HostConfig, HostContext, HostLogic, Outcome, WorkerPool};

/// A routing evaluator: given the input envelope, decide which targets it
/// fans out to. The built-in `StaticFanOut` ignores the envelope and always
/// returns the same configured list; richer evaluators are a seam for an
/// embedding application to register (§4.4.2, §9).
#[async_trait]
pub trait RoutingRule: Send + Sync {
    async fn evaluate(&self, env: &Envelope) -> Vec<String>;
}

pub struct StaticFanOut {
    pub targets: Vec<String>,
}

#[async_trait]
impl RoutingRule for StaticFanOut {
    async fn evaluate(&self, _env: &Envelope) -> Vec<String> {
        self.targets.clone()
    }
}

struct ProcessLogic {
    project_id: String,
    rule: Arc<dyn RoutingRule>,
    messaging_pattern: MessagingPattern,
    send_timeout: Duration,
}

#[async_trait]
impl HostLogic for ProcessLogic {
    async fn process(&self, env: Envelope, ctx: &HostContext) -> Result<Outcome, HostError> {
        let targets = self.rule.evaluate(&env).await;

        for target in &targets {
            let target_business_type = match ctx.registry.lookup(target).await {
                Ok(host) => BusinessType::from(host.kind()),
                Err(_) => BusinessType::External,
            };

            let (header_id, _seq) = ctx
                .trace
                .store_header(HeaderFields {
                    project_id: self.project_id.clone(),
                    session_id: env.session_id.clone(),
                    parent_header_id: Some(env.header_id),
                    corresponding_header_id: None,
                    super_session_id: None,
                    source_config_name: ctx.host_name.clone(),
                    target_config_name: target.clone(),
                    source_business_type: BusinessType::Process,
                    target_business_type,
                    message_type: String::new(),
                    body_class_name: env.body_class_name.clone(),
                    message_body_id: None,
                    leg_type: LegType::Request,
                    invocation: Invocation::Queue,
                    leg_priority: LegPriority::Async,
                    description: String::new(),
                    metadata: HashMap::new(),
                })
                .await?;

            let out_env = env.derive_for_leg(ctx.host_name.clone(), header_id);
            if let Err(e) = ctx
                .registry
                .send(target, out_env, self.messaging_pattern, self.send_timeout)
                .await
            {
                let _ = ctx
                    .trace
                    .update_header_status(header_id, crate::types::HeaderStatus::Error, true, Some(e.to_string()))
                    .await;
            }
        }

        // The input leg is completed once routing has been attempted,
        // whether zero, one, or many targets fired (§4.4.2).
        Ok(Outcome::Completed)
    }
}

pub struct ProcessHost {
    pool: WorkerPool,
}

impl ProcessHost {
    pub fn new(
        config: HostConfig,
        project_id: String,
        rule: Arc<dyn RoutingRule>,
        registry: Arc<ServiceRegistry>,
        trace: Arc<dyn Trace>,
        messaging_pattern: MessagingPattern,
        send_timeout: Duration,
    ) -> Self {
        let ctx = HostContext {
            host_name: config.name.clone(),
            registry,
            trace,
            target_config_names: config.target_config_names.clone(),
        };
        let logic = Arc::new(ProcessLogic {
            project_id,
            rule,
            messaging_pattern,
            send_timeout,
        });
        Self {
            pool: WorkerPool::new(config, logic, ctx),
        }
    }
}

#[async_trait]
impl Host for ProcessHost {
    fn name(&self) -> &str {
        self.pool.name()
    }

    fn kind(&self) -> HostKind {
        HostKind::Process
    }

    fn status(&self) -> HostStatus {
        self.pool.status(HostKind::Process)
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
