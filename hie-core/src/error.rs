//! Per-component error taxonomy (§7). Each enum classifies into a shared
//! [`FailureKind`] so the host runtime, registry, and trace can all reason
//! about "is this retryable" without knowing each other's concrete error
//! types.

use thiserror::Error;

/// The §7 failure taxonomy, independent of which component raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Config,
    TransportTransient,
    TransportPermanent,
    Validation,
    Timeout,
    Overflow,
    HostCrash,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown class_name `{0}`")]
    UnknownClass(String),
    #[error("malformed reply_code_actions `{0}`: {1}")]
    MalformedReplyCodeActions(String, String),
    #[error("pool_size must be in 1..=32, got {0}")]
    InvalidPoolSize(u32),
    #[error("{0}")]
    Other(String),
}

impl ConfigError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::Config
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("transport error (transient): {0}")]
    Transient(String),
    #[error("transport error (permanent): {0}")]
    Permanent(String),
    #[error("frame malformed: {0}")]
    MalformedFrame(String),
    #[error("operation timed out")]
    Timeout,
}

impl AdapterError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AdapterError::Transient(_) => FailureKind::TransportTransient,
            AdapterError::Permanent(_) => FailureKind::TransportPermanent,
            AdapterError::MalformedFrame(_) => FailureKind::Validation,
            AdapterError::Timeout => FailureKind::Timeout,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
    #[error("envelope rejected: queue at capacity")]
    Rejected,
    #[error("get cancelled")]
    Cancelled,
}

impl QueueError {
    pub fn kind(&self) -> FailureKind {
        match self {
            QueueError::Closed => FailureKind::HostCrash,
            QueueError::Rejected => FailureKind::Overflow,
            QueueError::Cancelled => FailureKind::Timeout,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("host `{0}` not registered")]
    NotFound(String),
    #[error("host `{0}` is not accepting work (stopped)")]
    Unavailable(String),
    #[error("timed out waiting for response")]
    Timeout,
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl RegistryError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RegistryError::NotFound(_) => FailureKind::Config,
            RegistryError::Unavailable(_) => FailureKind::HostCrash,
            RegistryError::Timeout => FailureKind::Timeout,
            RegistryError::Queue(q) => q.kind(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("header `{0}` is already terminal and cannot transition further")]
    AlreadyTerminal(uuid::Uuid),
    #[error("header `{0}` not found")]
    HeaderNotFound(uuid::Uuid),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error("restart budget exhausted ({0} restarts)")]
    RestartBudgetExhausted(u32),
}

impl HostError {
    pub fn kind(&self) -> FailureKind {
        match self {
            HostError::Config(e) => e.kind(),
            HostError::Adapter(e) => e.kind(),
            HostError::Queue(e) => e.kind(),
            HostError::Registry(e) => e.kind(),
            HostError::Trace(_) => FailureKind::HostCrash,
            HostError::RestartBudgetExhausted(_) => FailureKind::HostCrash,
        }
    }
}
