//! `Production` facade (§6.3): the top-level control surface that wires
//! configuration, the class registry, the host registry, and the trace
//! together. `hie-server`'s gRPC service delegates to this directly.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapter::FrameHandler;
use crate::classes::{resolve_inbound_adapter, HostBuildContext};
use crate::config::{HostItemConfig, ProductionConfig};
use crate::host::Host;
use crate::registry::ServiceRegistry;
use crate::trace::Trace;
use crate::types::HostStatus;

/// One deployed item: the `Host` plus (for inbound services) its
/// `FrameHandler` facet and the adapter task's cancellation handle, so
/// `Stop`/`Reload` can tear it down.
struct Deployed {
    item: HostItemConfig,
    host: Arc<dyn Host>,
    frame_handler: Option<Arc<dyn FrameHandler>>,
    inbound_cancel: Option<CancellationToken>,
}

/// Top-level orchestration facade (§6.3). One per running production;
/// `hie-server` holds it behind an `Arc` shared across gRPC calls.
pub struct Production {
    project_id: String,
    registry: Arc<ServiceRegistry>,
    trace: Arc<dyn Trace>,
    deployed: Mutex<HashMap<String, Deployed>>,
}

impl Production {
    pub fn new(project_id: String, trace: Arc<dyn Trace>) -> Self {
        Self {
            project_id,
            registry: Arc::new(ServiceRegistry::new()),
            trace,
            deployed: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> Arc<ServiceRegistry> {
        self.registry.clone()
    }

    pub fn trace(&self) -> Arc<dyn Trace> {
        self.trace.clone()
    }

    /// `Deploy(project_cfg)`: resolve classes, instantiate hosts, bind
    /// adapters, register. Does not start anything.
    pub async fn deploy(&self, cfg: ProductionConfig) -> Result<()> {
        if cfg.project_id != self.project_id {
            return Err(anyhow!(
                "config project_id {} does not match production {}",
                cfg.project_id,
                self.project_id
            ));
        }
        let registry_of_classes = crate::classes::builtin_registry();
        let mut deployed = self.deployed.lock().await;
        for item in cfg.items {
            if !item.enabled {
                continue;
            }
            let build_ctx = HostBuildContext {
                project_id: self.project_id.clone(),
                item: item.clone(),
                registry: self.registry.clone(),
                trace: self.trace.clone(),
            };
            let built = registry_of_classes
                .resolve(build_ctx)
                .map_err(|e| anyhow!("{}: {e}", item.name))?;
            self.registry.register(built.host.clone()).await;
            deployed.insert(
                item.name.clone(),
                Deployed {
                    item,
                    host: built.host,
                    frame_handler: built.frame_handler,
                    inbound_cancel: None,
                },
            );
        }
        info!(project_id = %self.project_id, "production deployed");
        Ok(())
    }

    /// `Start(project_id)`: start every deployed host's worker loop, and for
    /// inbound services (those with a bound `FrameHandler`), spawn their
    /// adapter task too.
    pub async fn start(&self) -> Result<()> {
        let mut deployed = self.deployed.lock().await;
        for d in deployed.values_mut() {
            let cancel = CancellationToken::new();
            d.host.start(cancel.clone()).await?;
            if let Some(handler) = d.frame_handler.clone() {
                let adapter = resolve_inbound_adapter(&d.item)?;
                let adapter_cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) = adapter.start(adapter_cancel, handler).await {
                        tracing::warn!(error = %e, "inbound adapter stopped with error");
                    }
                });
            }
            d.inbound_cancel = Some(cancel);
        }
        info!(project_id = %self.project_id, "production started");
        Ok(())
    }

    /// `Stop(project_id)`: stop every host and cancel adapter tasks.
    pub async fn stop(&self) -> Result<()> {
        let mut deployed = self.deployed.lock().await;
        for d in deployed.values_mut() {
            if let Some(cancel) = d.inbound_cancel.take() {
                cancel.cancel();
            }
            d.host.stop().await?;
        }
        info!(project_id = %self.project_id, "production stopped");
        Ok(())
    }

    /// `Reload(project_id)`: diff the item set against what's deployed.
    /// Vanished items are stopped and deregistered; new items are deployed
    /// and started; unchanged items (same settings) are left running so
    /// in-flight envelopes are never dropped.
    pub async fn reload(&self, cfg: ProductionConfig) -> Result<()> {
        let incoming: HashMap<String, HostItemConfig> = cfg.items.into_iter().map(|i| (i.name.clone(), i)).collect();

        let to_remove: Vec<String> = {
            let deployed = self.deployed.lock().await;
            deployed
                .keys()
                .filter(|name| !incoming.contains_key(*name))
                .cloned()
                .collect()
        };
        for name in to_remove {
            self.remove_host(&name).await?;
        }

        let registry_of_classes = crate::classes::builtin_registry();
        for (name, item) in incoming {
            let changed = {
                let deployed = self.deployed.lock().await;
                match deployed.get(&name) {
                    Some(existing) => !configs_equivalent(&existing.item, &item),
                    None => true,
                }
            };
            if !changed {
                continue;
            }
            if self.deployed.lock().await.contains_key(&name) {
                self.remove_host(&name).await?;
            }
            if !item.enabled {
                continue;
            }
            let build_ctx = HostBuildContext {
                project_id: self.project_id.clone(),
                item: item.clone(),
                registry: self.registry.clone(),
                trace: self.trace.clone(),
            };
            let built = registry_of_classes
                .resolve(build_ctx)
                .map_err(|e| anyhow!("{}: {e}", item.name))?;
            self.registry.register(built.host.clone()).await;
            let cancel = CancellationToken::new();
            built.host.start(cancel.clone()).await?;
            if let Some(handler) = built.frame_handler.clone() {
                let adapter = resolve_inbound_adapter(&item)?;
                let adapter_cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) = adapter.start(adapter_cancel, handler).await {
                        tracing::warn!(error = %e, "inbound adapter stopped with error");
                    }
                });
            }
            let mut deployed = self.deployed.lock().await;
            deployed.insert(
                name,
                Deployed {
                    item,
                    host: built.host,
                    frame_handler: built.frame_handler,
                    inbound_cancel: Some(cancel),
                },
            );
        }
        info!(project_id = %self.project_id, "production reloaded");
        Ok(())
    }

    async fn remove_host(&self, name: &str) -> Result<()> {
        let removed = self.deployed.lock().await.remove(name);
        if let Some(mut d) = removed {
            if let Some(cancel) = d.inbound_cancel.take() {
                cancel.cancel();
            }
            d.host.stop().await?;
            self.registry.deregister(name).await;
        }
        Ok(())
    }

    pub async fn scale_host(&self, name: &str, new_pool_size: u32) -> Result<()> {
        let deployed = self.deployed.lock().await;
        let d = deployed.get(name).ok_or_else(|| anyhow!("no such host: {name}"))?;
        let current = d.host.status().pool_size;
        if new_pool_size == current {
            return Ok(());
        }
        // Pool size is fixed at construction (`WorkerPool::start` spawns
        // `config.pool_size` workers once); an actual resize of a running
        // pool would need a resizable worker set, not implemented here.
        Err(anyhow!(
            "scale_host: {name} is running with pool_size={current}, resizing a running pool to {new_pool_size} is not supported in this core"
        ))
    }

    pub async fn pause_host(&self, name: &str) -> Result<()> {
        let deployed = self.deployed.lock().await;
        let d = deployed.get(name).ok_or_else(|| anyhow!("no such host: {name}"))?;
        d.host.pause().await?;
        Ok(())
    }

    pub async fn resume_host(&self, name: &str) -> Result<()> {
        let deployed = self.deployed.lock().await;
        let d = deployed.get(name).ok_or_else(|| anyhow!("no such host: {name}"))?;
        d.host.resume().await?;
        Ok(())
    }

    pub async fn restart_host(&self, name: &str) -> Result<()> {
        let deployed = self.deployed.lock().await;
        let d = deployed.get(name).ok_or_else(|| anyhow!("no such host: {name}"))?;
        d.host.stop().await?;
        d.host.start(CancellationToken::new()).await?;
        Ok(())
    }

    pub async fn status(&self) -> Vec<HostStatus> {
        self.deployed.lock().await.values().map(|d| d.host.status()).collect()
    }
}

fn configs_equivalent(a: &HostItemConfig, b: &HostItemConfig) -> bool {
    serde_json::to_value(a).ok() == serde_json::to_value(b).ok()
}
