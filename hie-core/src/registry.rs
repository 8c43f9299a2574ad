//! In-process service registry and messaging fabric (§4.5).
//!
//! A process-wide `Arc<ServiceRegistry>` injected into every host at
//! construction (never a global static, per §9's "global state" note),
//! wrapping an `RwLock<HashMap<String, Arc<dyn Host>>>`. Reply inboxes for
//! `SyncReliable`/`ConcurrentSync` are `oneshot::Sender<Envelope>` stashed in
//! a correlation-keyed map, a channel-per-waiter correlation pattern.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::host::Host;
use crate::types::{Envelope, MessagingPattern};

pub struct ServiceRegistry {
    hosts: RwLock<HashMap<String, Arc<dyn Host>>>,
    /// Reply inboxes keyed by the *request* leg's `header_id` -- the id a
    /// response envelope's `corresponding_header_id` resolves to.
    reply_inboxes: Mutex<HashMap<Uuid, oneshot::Sender<Envelope>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            reply_inboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Add a host under its name, replacing any existing registration
    /// (used by hot-reload).
    pub async fn register(&self, host: Arc<dyn Host>) {
        let name = host.name().to_string();
        self.hosts.write().await.insert(name, host);
    }

    pub async fn deregister(&self, name: &str) -> Option<Arc<dyn Host>> {
        self.hosts.write().await.remove(name)
    }

    pub async fn lookup(&self, name: &str) -> Result<Arc<dyn Host>, RegistryError> {
        self.hosts
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// `AsyncReliable`/`SyncReliable` dispatch to one target (§4.5).
    pub async fn send(
        &self,
        target_name: &str,
        env: Envelope,
        pattern: MessagingPattern,
        timeout: Duration,
    ) -> Result<Option<Envelope>, RegistryError> {
        let target = self.lookup(target_name).await?;
        match pattern {
            MessagingPattern::AsyncReliable | MessagingPattern::ConcurrentAsync => {
                target.enqueue(env).await.map_err(|_| RegistryError::Unavailable(target_name.to_string()))?;
                Ok(None)
            }
            MessagingPattern::SyncReliable | MessagingPattern::ConcurrentSync => {
                let header_id = env.header_id;
                let (tx, rx) = oneshot::channel();
                self.reply_inboxes.lock().await.insert(header_id, tx);
                if let Err(e) = target.enqueue(env).await {
                    self.reply_inboxes.lock().await.remove(&header_id);
                    return Err(RegistryError::Unavailable(format!("{target_name}: {e}")));
                }
                match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(response)) => Ok(Some(response)),
                    Ok(Err(_canceled)) => Err(RegistryError::Timeout),
                    Err(_elapsed) => {
                        self.reply_inboxes.lock().await.remove(&header_id);
                        Err(RegistryError::Timeout)
                    }
                }
            }
        }
    }

    /// `ConcurrentAsync`/`ConcurrentSync` dispatch to many targets in
    /// parallel, ordered by the caller's `target_names` list. Per-target
    /// errors are returned without aborting the others.
    pub async fn send_concurrent(
        self: &Arc<Self>,
        target_names: &[String],
        env: Envelope,
        pattern: MessagingPattern,
        timeout: Duration,
    ) -> Vec<Result<Option<Envelope>, RegistryError>> {
        let mut set = tokio::task::JoinSet::new();
        for (index, name) in target_names.iter().cloned().enumerate() {
            let registry = self.clone();
            let env = env.clone();
            set.spawn(async move { (index, registry.send(&name, env, pattern, timeout).await) });
        }
        let mut results: Vec<Option<Result<Option<Envelope>, RegistryError>>> =
            (0..target_names.len()).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(join_err) => {
                    warn!(error = %join_err, "concurrent send task panicked");
                }
            }
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or(Err(RegistryError::Timeout)))
            .collect()
    }

    /// Called by a host family when it emits a `Response` envelope whose
    /// `corresponding_header_id` is set: deliver it to the waiting inbox, if
    /// any. Returns `true` if a waiter was found (no waiter means the
    /// original `Send` already timed out -- an orphaned response, §8.2 S4).
    pub async fn deliver_response(&self, corresponding_header_id: Uuid, response: Envelope) -> bool {
        if let Some(tx) = self.reply_inboxes.lock().await.remove(&corresponding_header_id) {
            if tx.send(response).is_ok() {
                return true;
            }
        }
        warn!(header_id = %corresponding_header_id, "response has no waiting inbox (orphaned)");
        false
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HostError;
    use crate::host::Host;
    use crate::types::{HostKind, HostState, HostStatus};
    use async_trait::async_trait;
    use tokio::sync::Mutex as TokioMutex;
    use tokio_util::sync::CancellationToken;

    struct StubHost {
        name: String,
        received: Arc<TokioMutex<Vec<Envelope>>>,
    }

    #[async_trait]
    impl Host for StubHost {
        fn name(&self) -> &str {
            &self.name
        }
        fn kind(&self) -> HostKind {
            HostKind::Operation
        }
        fn status(&self) -> HostStatus {
            HostStatus {
                name: self.name.clone(),
                kind: HostKind::Operation,
                state: HostState::Running,
                pool_size: 1,
                queue_len: 0,
                restart_count: 0,
            }
        }
        async fn start(&self, _cancel: CancellationToken) -> Result<(), HostError> {
            Ok(())
        }
        async fn stop(&self) -> Result<(), HostError> {
            Ok(())
        }
        async fn pause(&self) -> Result<(), HostError> {
            Ok(())
        }
        async fn resume(&self) -> Result<(), HostError> {
            Ok(())
        }
        async fn enqueue(&self, env: Envelope) -> Result<(), HostError> {
            self.received.lock().await.push(env);
            Ok(())
        }
    }

    fn env() -> Envelope {
        Envelope::new_session("src", vec![1], "application/hl7", "ADT", Uuid::now_v7(), Uuid::now_v7())
    }

    #[tokio::test]
    async fn async_reliable_delivers_without_waiting() {
        let registry = ServiceRegistry::new();
        let received = Arc::new(TokioMutex::new(Vec::new()));
        registry
            .register(Arc::new(StubHost {
                name: "target".into(),
                received: received.clone(),
            }))
            .await;
        let result = registry
            .send("target", env(), MessagingPattern::AsyncReliable, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(received.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn lookup_missing_host_returns_not_found() {
        let registry = ServiceRegistry::new();
        let err = registry.lookup("nope").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn sync_reliable_times_out_without_response() {
        let registry = ServiceRegistry::new();
        let received = Arc::new(TokioMutex::new(Vec::new()));
        registry
            .register(Arc::new(StubHost {
                name: "target".into(),
                received,
            }))
            .await;
        let err = registry
            .send("target", env(), MessagingPattern::SyncReliable, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Timeout));
    }

    #[tokio::test]
    async fn sync_reliable_receives_delivered_response() {
        let registry = Arc::new(ServiceRegistry::new());
        let received = Arc::new(TokioMutex::new(Vec::new()));
        registry
            .register(Arc::new(StubHost {
                name: "target".into(),
                received,
            }))
            .await;
        let request = env();
        let header_id = request.header_id;
        let registry_clone = registry.clone();
        let response = env();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            registry_clone.deliver_response(header_id, response).await;
        });
        let result = registry
            .send("target", request, MessagingPattern::SyncReliable, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(result.is_some());
    }
}
