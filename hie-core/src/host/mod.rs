//! Generic host lifecycle and worker-pool executor (§4.3).
//!
//! One `WorkerPool` drives a queue-backed host (routing process, outbound
//! operation) through the lifecycle state machine, running the 9-step
//! worker loop per envelope and applying the restart policy when a worker
//! crashes. Inbound services (§4.4.1) don't pull from a queue at all -- the
//! adapter callback drives them directly -- so `ServiceHost` in
//! `host::service` does not use `WorkerPool`.

pub mod operation;
pub mod process;
pub mod service;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::HostError;
use crate::queue::ReliableQueue;
use crate::registry::ServiceRegistry;
use crate::trace::Trace;
use crate::types::{Envelope, ExecutionMode, HostKind, HostState, HostStatus, RestartPolicy};

pub use operation::OperationHost;
pub use process::{RoutingRule, StaticFanOut};
pub use service::ServiceHost;

/// A configured, named worker unit (§3.1). All three host families
/// implement this so the registry and the production facade can treat them
/// uniformly for lifecycle control.
#[async_trait]
pub trait Host: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> HostKind;
    fn status(&self) -> HostStatus;
    async fn start(&self, cancel: CancellationToken) -> Result<(), HostError>;
    async fn stop(&self) -> Result<(), HostError>;
    async fn pause(&self) -> Result<(), HostError>;
    async fn resume(&self) -> Result<(), HostError>;
    /// Admit an envelope for processing. Queue-backed hosts enqueue it;
    /// `ServiceHost` (driven by its adapter instead) returns `Unavailable`.
    async fn enqueue(&self, env: Envelope) -> Result<(), HostError>;
}

/// Per-host configuration resolved from the §6.2 item/settings tree.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub name: String,
    pub class_name: String,
    pub pool_size: u32,
    pub execution_mode: ExecutionMode,
    pub queue_type: crate::types::QueueType,
    pub queue_size: usize,
    pub overflow_strategy: crate::types::OverflowPolicy,
    pub restart_policy: RestartPolicy,
    pub max_restarts: u32,
    pub restart_delay: Duration,
    pub messaging_pattern: crate::types::MessagingPattern,
    pub message_timeout: Duration,
    pub max_retries: u32,
    pub target_config_names: Vec<String>,
}

/// What a family's `HostLogic::process` decided about one envelope, handed
/// back to the generic worker loop so it can apply the shared trace/queue
/// bookkeeping (§4.3 steps 8-9) uniformly across host families.
pub enum Outcome {
    /// Business processing succeeded; mark `env.header_id` completed, ack.
    Completed,
    /// Transient failure; requeue with incremented retry count, no trace
    /// transition (the header stays non-terminal for the retry).
    Retry,
    /// Terminal business failure; mark `env.header_id` error, do not
    /// requeue.
    Failed { error_status: String },
}

/// Shared dependencies every queue-backed host family needs to do its work,
/// injected rather than held as globals (§9 "global state").
pub struct HostContext {
    pub host_name: String,
    pub registry: Arc<ServiceRegistry>,
    pub trace: Arc<dyn Trace>,
    pub target_config_names: Vec<String>,
}

/// Family-specific envelope processing, invoked once per dequeued envelope
/// by `WorkerPool`. `Err` denotes a worker-level crash (subject to restart
/// policy); `Ok(Outcome)` denotes a business-level result.
#[async_trait]
pub trait HostLogic: Send + Sync {
    async fn process(&self, env: Envelope, ctx: &HostContext) -> Result<Outcome, HostError>;
}

/// Tracks host-level restart budget: `max_restarts` within a rolling window
/// that resets after `restart_delay * 10` of uninterrupted healthy
/// operation (§4.3).
struct RestartBudget {
    count: AtomicU32,
    window_start: Mutex<Instant>,
}

impl RestartBudget {
    fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
            window_start: Mutex::new(Instant::now()),
        }
    }

    /// Record a restart. Returns `Err(())` if the budget is exhausted.
    async fn record(&self, max_restarts: u32, restart_delay: Duration) -> Result<(), ()> {
        let mut window_start = self.window_start.lock().await;
        if window_start.elapsed() > restart_delay * 10 {
            self.count.store(0, Ordering::SeqCst);
            *window_start = Instant::now();
        }
        let prev = self.count.fetch_add(1, Ordering::SeqCst);
        if prev >= max_restarts {
            Err(())
        } else {
            Ok(())
        }
    }
}

enum WorkerExit {
    /// Cancellation token fired, or queue closed during shutdown drain.
    Stopped,
    /// The worker's own loop iteration returned a crash (`Err(HostError)`).
    Crashed,
    /// `RestartPolicy::Always` respawns even clean exits; this variant is
    /// reserved for that case but the current worker loop never exits
    /// cleanly on its own (it only stops or crashes).
    #[allow(dead_code)]
    Clean,
}

/// Generic lifecycle + worker-pool executor shared by the queue-backed host
/// families (§4.3 Implementation note).
pub struct WorkerPool {
    name: String,
    config: HostConfig,
    queue: Arc<ReliableQueue>,
    logic: Arc<dyn HostLogic>,
    ctx: HostContext,
    state_tx: watch::Sender<HostState>,
    state_rx: watch::Receiver<HostState>,
    restart_budget: Arc<RestartBudget>,
}

impl WorkerPool {
    pub fn new(config: HostConfig, logic: Arc<dyn HostLogic>, ctx: HostContext) -> Self {
        let (state_tx, state_rx) = watch::channel(HostState::Created);
        Self::with_state_channel(config, logic, ctx, state_tx, state_rx)
    }

    /// Like `new`, but takes an externally-constructed state channel so a
    /// `HostLogic` impl can hold its own sender clone (e.g. `OperationLogic`
    /// transitioning its own host to `Paused` on a `Disable` reply-code
    /// action, §4.4.3 step 4).
    pub fn with_state_channel(
        config: HostConfig,
        logic: Arc<dyn HostLogic>,
        ctx: HostContext,
        state_tx: watch::Sender<HostState>,
        state_rx: watch::Receiver<HostState>,
    ) -> Self {
        let queue = Arc::new(ReliableQueue::new(
            config.queue_type,
            config.queue_size,
            config.overflow_strategy,
            config.max_retries,
        ));
        Self {
            name: config.name.clone(),
            config,
            queue,
            logic,
            ctx,
            state_tx,
            state_rx,
            restart_budget: Arc::new(RestartBudget::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pool itself is kind-agnostic; the owning family supplies its
    /// `HostKind` for the status report.
    pub fn status(&self, kind: HostKind) -> HostStatus {
        HostStatus {
            name: self.name.clone(),
            kind,
            state: *self.state_rx.borrow(),
            pool_size: self.config.pool_size,
            queue_len: 0,
            restart_count: self.restart_budget.count.load(Ordering::SeqCst),
        }
    }

    pub fn queue_handle(&self) -> Arc<ReliableQueue> {
        self.queue.clone()
    }

    pub async fn enqueue(&self, env: Envelope) -> Result<(), HostError> {
        let state = *self.state_rx.borrow();
        if state == HostState::Stopped || state == HostState::Failed {
            return Err(HostError::Registry(crate::error::RegistryError::Unavailable(
                self.name.clone(),
            )));
        }
        let discarded = self.queue.put(env, 5).await?;
        if let Some(d) = discarded {
            let _ = self
                .ctx
                .trace
                .update_header_status(d.header_id, crate::types::HeaderStatus::Discarded, false, None)
                .await;
        }
        Ok(())
    }

    pub async fn start(&self, cancel: CancellationToken) -> Result<(), HostError> {
        let _ = self.state_tx.send(HostState::Initialising);
        let _ = self.state_tx.send(HostState::Running);
        info!(host = %self.name, pool_size = self.config.pool_size, "host starting");
        for worker_id in 0..self.config.pool_size {
            let queue = self.queue.clone();
            let logic = self.logic.clone();
            let ctx = HostContext {
                host_name: self.ctx.host_name.clone(),
                registry: self.ctx.registry.clone(),
                trace: self.ctx.trace.clone(),
                target_config_names: self.ctx.target_config_names.clone(),
            };
            let state_rx = self.state_rx.clone();
            let restart_budget = self.restart_budget.clone();
            let config = self.config.clone();
            let state_tx = self.state_tx.clone();
            let cancel = cancel.clone();
            match config.execution_mode {
                ExecutionMode::Cooperative | ExecutionMode::Single => {
                    tokio::spawn(supervise_worker(
                        worker_id, queue, logic, ctx, state_rx, restart_budget, config, state_tx, cancel,
                    ));
                }
                ExecutionMode::ThreadPool => {
                    tokio::task::spawn_blocking(move || {
                        tokio::runtime::Handle::current().block_on(supervise_worker(
                            worker_id, queue, logic, ctx, state_rx, restart_budget, config, state_tx, cancel,
                        ));
                    });
                }
                ExecutionMode::ProcessPool => {
                    warn!(
                        host = %self.name,
                        "process_pool execution_mode not implemented, falling back to thread_pool"
                    );
                    tokio::task::spawn_blocking(move || {
                        tokio::runtime::Handle::current().block_on(supervise_worker(
                            worker_id, queue, logic, ctx, state_rx, restart_budget, config, state_tx, cancel,
                        ));
                    });
                }
            }
        }
        Ok(())
    }

    pub async fn stop(&self, drain_timeout: Duration) -> Result<(), HostError> {
        let _ = self.state_tx.send(HostState::Stopping);
        self.queue.close().await;
        tokio::time::sleep(Duration::from_millis(10).min(drain_timeout)).await;
        let remaining = self.queue.drain_remaining().await;
        for env in remaining {
            let _ = self
                .ctx
                .trace
                .update_header_status(env.header_id, crate::types::HeaderStatus::Queued, false, None)
                .await;
        }
        let _ = self.state_tx.send(HostState::Stopped);
        info!(host = %self.name, "host stopped");
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), HostError> {
        let _ = self.state_tx.send(HostState::Paused);
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), HostError> {
        let _ = self.state_tx.send(HostState::Running);
        Ok(())
    }
}

/// Drive one worker slot, respawning it per the restart policy whenever its
/// loop iteration crashes.
#[allow(clippy::too_many_arguments)]
async fn supervise_worker(
    worker_id: u32,
    queue: Arc<ReliableQueue>,
    logic: Arc<dyn HostLogic>,
    ctx: HostContext,
    state_rx: watch::Receiver<HostState>,
    restart_budget: Arc<RestartBudget>,
    config: HostConfig,
    state_tx: watch::Sender<HostState>,
    cancel: CancellationToken,
) {
    loop {
        let exit = run_worker_generation(worker_id, &queue, &logic, &ctx, &state_rx, &config, &cancel).await;
        match exit {
            WorkerExit::Stopped => break,
            WorkerExit::Crashed | WorkerExit::Clean => {
                if matches!(exit, WorkerExit::Clean) && config.restart_policy != RestartPolicy::Always {
                    break;
                }
                if config.restart_policy == RestartPolicy::Never {
                    warn!(host = %ctx.host_name, worker_id, "worker crashed, restart_policy=Never, host failing");
                    let _ = state_tx.send(HostState::Failed);
                    break;
                }
                match restart_budget.record(config.max_restarts, config.restart_delay).await {
                    Ok(()) => {
                        warn!(host = %ctx.host_name, worker_id, "worker crashed, restarting after restart_delay");
                        tokio::time::sleep(config.restart_delay).await;
                        continue;
                    }
                    Err(()) => {
                        warn!(host = %ctx.host_name, worker_id, "restart budget exhausted, host failing");
                        let _ = state_tx.send(HostState::Failed);
                        break;
                    }
                }
            }
        }
    }
}

async fn run_worker_generation(
    worker_id: u32,
    queue: &Arc<ReliableQueue>,
    logic: &Arc<dyn HostLogic>,
    ctx: &HostContext,
    state_rx: &watch::Receiver<HostState>,
    config: &HostConfig,
    cancel: &CancellationToken,
) -> WorkerExit {
    loop {
        if cancel.is_cancelled() {
            return WorkerExit::Stopped;
        }
        // Step 1: wait for a not-paused signal.
        while *state_rx.borrow() == HostState::Paused {
            if cancel.is_cancelled() {
                return WorkerExit::Stopped;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if matches!(*state_rx.borrow(), HostState::Stopping | HostState::Stopped) {
            return WorkerExit::Stopped;
        }

        // Step 2: dequeue with message_timeout as the max wait.
        let env = tokio::select! {
            _ = cancel.cancelled() => return WorkerExit::Stopped,
            res = queue.get(config.message_timeout) => res,
        };
        let env = match env {
            Ok(env) => env,
            Err(crate::error::QueueError::Closed) => return WorkerExit::Stopped,
            Err(crate::error::QueueError::Cancelled) => continue,
            Err(crate::error::QueueError::Rejected) => continue,
        };

        // Step 3: TTL expiry check.
        if env.is_expired() {
            let _ = ctx
                .trace
                .update_header_status(env.header_id, crate::types::HeaderStatus::Discarded, false, None)
                .await;
            queue.ack(&env).await;
            continue;
        }

        debug!(host = %ctx.host_name, worker_id, session_id = %env.session_id, "processing envelope");

        // Steps 4-7: family-specific processing, time-boxed to
        // message_timeout.
        let processed = tokio::time::timeout(config.message_timeout, logic.process(env.clone(), ctx)).await;

        match processed {
            Err(_elapsed) => {
                let _ = ctx
                    .trace
                    .update_header_status(
                        env.header_id,
                        crate::types::HeaderStatus::Error,
                        true,
                        Some("TimedOut".to_string()),
                    )
                    .await;
                queue.nack(env, false).await;
            }
            Ok(Ok(Outcome::Completed)) => {
                let _ = ctx
                    .trace
                    .update_header_status(env.header_id, crate::types::HeaderStatus::Completed, false, None)
                    .await;
                queue.ack(&env).await;
            }
            Ok(Ok(Outcome::Retry)) => {
                queue.nack(env, true).await;
            }
            Ok(Ok(Outcome::Failed { error_status })) => {
                let _ = ctx
                    .trace
                    .update_header_status(env.header_id, crate::types::HeaderStatus::Error, true, Some(error_status))
                    .await;
                queue.nack(env, false).await;
            }
            Ok(Err(host_err)) => {
                warn!(host = %ctx.host_name, worker_id, error = %host_err, "worker crashed processing envelope");
                let _ = ctx
                    .trace
                    .update_header_status(
                        env.header_id,
                        crate::types::HeaderStatus::Error,
                        true,
                        Some(host_err.to_string()),
                    )
                    .await;
                queue.nack(env, false).await;
                return WorkerExit::Crashed;
            }
        }
    }
}
