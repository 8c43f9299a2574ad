//! Class registry + import policy (§9 "Dynamic class instantiation").
//!
//! Configuration refers to hosts by a string `class_name`; this module
//! resolves that string to a constructor at `Deploy` time instead of doing
//! any runtime reflection. Only the `engine.*` prefix is permitted in this
//! core -- `project.*` user-supplied classes are a seam left for an
//! embedding application, not implemented here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};

use crate::adapter::file::{FileInbound, FileInboundConfig, FileOutbound, FileOutboundConfig};
use crate::adapter::http::{HttpInbound, HttpInboundConfig, HttpOutbound, HttpOutboundConfig};
use crate::adapter::mllp::{MllpInbound, MllpInboundConfig, MllpOutbound, MllpOutboundConfig, SslConfig};
use crate::adapter::{FrameHandler, InboundAdapter, OutboundAdapter};
use crate::config::{AdapterSettings, HostItemConfig, HostSettings, SslSettings};
use crate::host::{Host, HostConfig, ServiceHost, StaticFanOut};
use crate::host::process::ProcessHost;
use crate::host::operation::OperationHost;
use crate::host::service::{AckMode, Protocol, ServiceConfig};
use crate::registry::ServiceRegistry;
use crate::trace::Trace;

/// Everything a built-in factory needs to turn one `HostItemConfig` into a
/// running `Host`, beyond the identifier itself.
pub struct HostBuildContext {
    pub project_id: String,
    pub item: HostItemConfig,
    pub registry: Arc<ServiceRegistry>,
    pub trace: Arc<dyn Trace>,
}

/// What a factory produces: the `Host` for lifecycle control, plus --
/// for inbound service classes only -- the same concrete host re-exposed
/// as a `FrameHandler` so `Production::start` can bind it to its adapter.
/// Built at construction time (while the concrete type is still known)
/// rather than recovered later by downcasting `Arc<dyn Host>`.
pub struct BuiltHost {
    pub host: Arc<dyn Host>,
    pub frame_handler: Option<Arc<dyn FrameHandler>>,
}

pub type HostFactory = fn(HostBuildContext) -> anyhow::Result<BuiltHost>;

/// `engine.*`-only import policy (§9): unknown or policy-forbidden
/// identifiers fail `Deploy` loudly rather than being silently skipped.
pub struct ClassRegistry {
    factories: HashMap<&'static str, HostFactory>,
    allowed_prefixes: Vec<&'static str>,
}

impl ClassRegistry {
    pub fn resolve(&self, ctx: HostBuildContext) -> anyhow::Result<BuiltHost> {
        let class_name = ctx.item.class_name.clone();
        if !self.allowed_prefixes.iter().any(|p| class_name.starts_with(p)) {
            bail!("class_name `{class_name}` not permitted by import policy (allowed prefixes: {:?})", self.allowed_prefixes);
        }
        let factory = self
            .factories
            .get(class_name.as_str())
            .ok_or_else(|| anyhow!("unknown class_name `{class_name}`"))?;
        factory(ctx)
    }

    pub fn is_known(&self, class_name: &str) -> bool {
        self.factories.contains_key(class_name)
    }
}

/// The built-in registry: `engine.hl7.Service`, `engine.hl7.Operation`,
/// `engine.routing.Process`, `engine.file.Service`, `engine.file.Operation`.
pub fn builtin_registry() -> ClassRegistry {
    let mut factories: HashMap<&'static str, HostFactory> = HashMap::new();
    factories.insert("engine.hl7.Service", build_hl7_service);
    factories.insert("engine.hl7.Operation", build_hl7_operation);
    factories.insert("engine.routing.Process", build_routing_process);
    factories.insert("engine.file.Service", build_file_service);
    factories.insert("engine.file.Operation", build_file_operation);
    ClassRegistry {
        factories,
        allowed_prefixes: vec!["engine."],
    }
}

fn host_config(item: &HostItemConfig) -> HostConfig {
    HostConfig {
        name: item.name.clone(),
        class_name: item.class_name.clone(),
        pool_size: item.pool_size,
        execution_mode: item.execution_mode,
        queue_type: item.queue_type,
        queue_size: item.queue_size,
        overflow_strategy: item.overflow_strategy,
        restart_policy: item.restart_policy,
        max_restarts: item.max_restarts,
        restart_delay: item.restart_delay(),
        messaging_pattern: item.messaging_pattern,
        message_timeout: item.message_timeout(),
        max_retries: item.max_restarts,
        target_config_names: item.target_config_names.clone(),
    }
}

fn ssl_config(settings: &Option<SslSettings>) -> Option<SslConfig> {
    settings.as_ref().map(|s| SslConfig {
        enabled: s.enabled,
        cert_path: s.cert_path.clone(),
        key_path: s.key_path.clone(),
    })
}

fn ack_mode(raw: &str) -> AckMode {
    match raw {
        "Immediate" => AckMode::Immediate,
        "Never" => AckMode::Never,
        _ => AckMode::App,
    }
}

/// `engine.hl7.Service`: an inbound MLLP or HTTP service host speaking HL7.
/// Constructs the `ServiceHost` and returns it alongside its own
/// `FrameHandler` facet so `Production::start` can drive both together.
fn build_hl7_service(ctx: HostBuildContext) -> anyhow::Result<BuiltHost> {
    let HostSettings::HlService {
        message_schema_category,
        target_config_names,
        ack_mode: ack_mode_raw,
        use_ack_commit_codes,
    } = ctx.item.host.clone().ok_or_else(|| anyhow!("engine.hl7.Service requires host settings"))?
    else {
        bail!("engine.hl7.Service requires `host.kind: hl_service` settings");
    };

    let config = ServiceConfig {
        name: ctx.item.name.clone(),
        project_id: ctx.project_id.clone(),
        protocol: Protocol::Hl7,
        message_schema_category,
        target_config_names,
        ack_mode: ack_mode(&ack_mode_raw),
        use_ack_commit_codes,
        messaging_pattern: ctx.item.messaging_pattern,
        send_timeout: ctx.item.message_timeout(),
    };
    let service = Arc::new(ServiceHost::new(config, ctx.registry, ctx.trace));
    Ok(BuiltHost {
        host: service.clone(),
        frame_handler: Some(service),
    })
}

/// `engine.file.Service`: inbound file-drop service. Same host logic as
/// `engine.hl7.Service` (HL7 parsing), different adapter.
fn build_file_service(ctx: HostBuildContext) -> anyhow::Result<BuiltHost> {
    build_hl7_service(ctx)
}

/// Build the inbound adapter an `engine.*.Service` item's `adapter.*`
/// settings describe. Not part of the `HostFactory` signature (the plain
/// `Host` trait has no room for an adapter); callers that need to actually
/// run the service (not just construct it for inspection) should use
/// `resolve_inbound_adapter` alongside `ClassRegistry::resolve`.
pub fn resolve_inbound_adapter(item: &HostItemConfig) -> anyhow::Result<Arc<dyn InboundAdapter>> {
    match item
        .adapter
        .clone()
        .ok_or_else(|| anyhow!("{}: missing adapter settings", item.name))?
    {
        AdapterSettings::MllpInbound {
            port,
            stay_connected,
            read_timeout_ms,
            ssl_config: ssl,
        } => Ok(Arc::new(MllpInbound::new(MllpInboundConfig {
            port,
            stay_connected,
            read_timeout: Duration::from_millis(read_timeout_ms),
            ssl_config: ssl_config(&ssl),
        }))),
        AdapterSettings::HttpInbound {
            port,
            base_path,
            allowed_methods,
            max_body_size,
            enable_cors: _,
            ssl_config: ssl,
        } => Ok(Arc::new(HttpInbound::new(HttpInboundConfig {
            port,
            base_path,
            allowed_methods,
            max_body_size,
            enable_cors: false,
            ssl_config: ssl_config(&ssl),
        }))),
        AdapterSettings::FileInbound {
            file_path: _,
            file_spec,
            poll_interval_ms,
            archive_path,
            work_path,
            error_path,
            semaphore_spec: _,
        } => Ok(Arc::new(FileInbound::new(FileInboundConfig {
            work_path: work_path.into(),
            file_spec,
            archive_path: archive_path.map(Into::into),
            error_path: error_path.into(),
            poll_interval: Duration::from_millis(poll_interval_ms),
        }))),
        other => bail!("{}: adapter settings {other:?} are not an inbound adapter", item.name),
    }
}

/// Build the outbound adapter an `engine.*.Operation` item's `adapter.*`
/// settings describe.
pub fn resolve_outbound_adapter(item: &HostItemConfig) -> anyhow::Result<Arc<dyn OutboundAdapter>> {
    match item
        .adapter
        .clone()
        .ok_or_else(|| anyhow!("{}: missing adapter settings", item.name))?
    {
        AdapterSettings::MllpOutbound {
            ip_address,
            port,
            connect_timeout_ms,
            response_timeout_ms,
            reconnect_retry,
            stay_connected,
            local_interface: _,
            ssl_config: ssl,
        } => Ok(Arc::new(MllpOutbound::new(MllpOutboundConfig {
            ip_address,
            port,
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            response_timeout: Duration::from_millis(response_timeout_ms),
            reconnect_retry,
            stay_connected,
            ssl_config: ssl_config(&ssl),
        }))),
        AdapterSettings::HttpOutbound {
            url,
            method,
            content_type,
            custom_headers,
            ssl_config: ssl,
        } => Ok(Arc::new(HttpOutbound::new(HttpOutboundConfig {
            url,
            method,
            content_type,
            custom_headers,
            response_timeout: item.message_timeout(),
            ssl_config: ssl_config(&ssl),
        }))),
        AdapterSettings::FileOutbound {
            file_path,
            filename_template,
            overwrite,
        } => Ok(Arc::new(FileOutbound::new(FileOutboundConfig {
            file_path: file_path.into(),
            filename_template,
            overwrite,
        }))),
        other => bail!("{}: adapter settings {other:?} are not an outbound adapter", item.name),
    }
}

/// Label for the external system an outbound adapter talks to (peer
/// address/URL/path), used as the `target_config_name`/`source_config_name`
/// on an operation's external-leg trace rows -- the peer isn't a configured
/// host, so it has no registry entry of its own (§8.2 S1 legs 4-7).
fn peer_label(item: &HostItemConfig) -> anyhow::Result<String> {
    match item
        .adapter
        .as_ref()
        .ok_or_else(|| anyhow!("{}: missing adapter settings", item.name))?
    {
        AdapterSettings::MllpOutbound { ip_address, port, .. } => Ok(format!("{ip_address}:{port}")),
        AdapterSettings::HttpOutbound { url, .. } => Ok(url.clone()),
        AdapterSettings::FileOutbound { file_path, .. } => Ok(file_path.clone()),
        other => bail!("{}: adapter settings {other:?} are not an outbound adapter", item.name),
    }
}

fn build_hl7_operation(ctx: HostBuildContext) -> anyhow::Result<BuiltHost> {
    let HostSettings::HlOperation {
        reply_code_actions,
        archive_io: _,
        failure_timeout_ms,
        retry_interval_ms,
    } = ctx.item.host.clone().ok_or_else(|| anyhow!("engine.hl7.Operation requires host settings"))?
    else {
        bail!("engine.hl7.Operation requires `host.kind: hl_operation` settings");
    };
    let peer = peer_label(&ctx.item)?;
    let adapter = resolve_outbound_adapter(&ctx.item)?;
    let host = OperationHost::new(
        host_config(&ctx.item),
        ctx.project_id.clone(),
        true,
        adapter,
        peer,
        &reply_code_actions,
        Duration::from_millis(retry_interval_ms),
        Duration::from_millis(failure_timeout_ms),
        ctx.registry,
        ctx.trace,
    )?;
    Ok(BuiltHost {
        host: Arc::new(host),
        frame_handler: None,
    })
}

fn build_file_operation(ctx: HostBuildContext) -> anyhow::Result<BuiltHost> {
    let HostSettings::HlOperation {
        reply_code_actions,
        archive_io: _,
        failure_timeout_ms,
        retry_interval_ms,
    } = ctx.item.host.clone().ok_or_else(|| anyhow!("engine.file.Operation requires host settings"))?
    else {
        bail!("engine.file.Operation requires `host.kind: hl_operation` settings");
    };
    let peer = peer_label(&ctx.item)?;
    let adapter = resolve_outbound_adapter(&ctx.item)?;
    let host = OperationHost::new(
        host_config(&ctx.item),
        ctx.project_id.clone(),
        false,
        adapter,
        peer,
        &reply_code_actions,
        Duration::from_millis(retry_interval_ms),
        Duration::from_millis(failure_timeout_ms),
        ctx.registry,
        ctx.trace,
    )?;
    Ok(BuiltHost {
        host: Arc::new(host),
        frame_handler: None,
    })
}

fn build_routing_process(ctx: HostBuildContext) -> anyhow::Result<BuiltHost> {
    let rule = Arc::new(StaticFanOut {
        targets: ctx.item.target_config_names.clone(),
    });
    let host = ProcessHost::new(
        host_config(&ctx.item),
        ctx.project_id.clone(),
        rule,
        ctx.registry,
        ctx.trace,
        ctx.item.messaging_pattern,
        ctx.item.message_timeout(),
    );
    Ok(BuiltHost {
        host: Arc::new(host),
        frame_handler: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostItemConfig;
    use crate::trace::MemoryTrace;
    use crate::types::{ExecutionMode, MessagingPattern, OverflowPolicy, QueueType, RestartPolicy};

    fn item(class_name: &str, host: Option<HostSettings>, adapter: Option<AdapterSettings>) -> HostItemConfig {
        HostItemConfig {
            name: "Test-Host".into(),
            class_name: class_name.into(),
            category: String::new(),
            pool_size: 1,
            enabled: true,
            foreground: false,
            log_trace_events: false,
            schedule: None,
            comment: String::new(),
            execution_mode: ExecutionMode::Cooperative,
            worker_count: 1,
            queue_type: QueueType::Fifo,
            queue_size: 100,
            overflow_strategy: OverflowPolicy::Block,
            restart_policy: RestartPolicy::OnFailure,
            max_restarts: 3,
            restart_delay_ms: 100,
            messaging_pattern: MessagingPattern::AsyncReliable,
            message_timeout_ms: 5000,
            target_config_names: vec![],
            adapter,
            host,
        }
    }

    #[test]
    fn unknown_class_name_is_rejected() {
        let registry = builtin_registry();
        let ctx = HostBuildContext {
            project_id: "P".into(),
            item: item("project.custom.Thing", None, None),
            registry: Arc::new(ServiceRegistry::new()),
            trace: Arc::new(MemoryTrace::new()),
        };
        let err = registry.resolve(ctx).unwrap_err();
        assert!(err.to_string().contains("not permitted"));
    }

    #[test]
    fn builds_routing_process_host() {
        let registry = builtin_registry();
        let ctx = HostBuildContext {
            project_id: "P".into(),
            item: item("engine.routing.Process", None, None),
            registry: Arc::new(ServiceRegistry::new()),
            trace: Arc::new(MemoryTrace::new()),
        };
        let built = registry.resolve(ctx).unwrap();
        assert_eq!(built.host.name(), "Test-Host");
        assert!(built.frame_handler.is_none());
    }

    #[test]
    fn builds_hl7_operation_host_from_settings() {
        let registry = builtin_registry();
        let host_settings = HostSettings::HlOperation {
            reply_code_actions: "AA=C,*=S".into(),
            archive_io: false,
            failure_timeout_ms: 5000,
            retry_interval_ms: 100,
        };
        let adapter_settings = AdapterSettings::MllpOutbound {
            ip_address: "10.0.0.1".into(),
            port: 6662,
            connect_timeout_ms: 1000,
            response_timeout_ms: 1000,
            reconnect_retry: 3,
            stay_connected: -1,
            local_interface: None,
            ssl_config: None,
        };
        let ctx = HostBuildContext {
            project_id: "P".into(),
            item: item("engine.hl7.Operation", Some(host_settings), Some(adapter_settings)),
            registry: Arc::new(ServiceRegistry::new()),
            trace: Arc::new(MemoryTrace::new()),
        };
        let built = registry.resolve(ctx).unwrap();
        assert_eq!(built.host.kind(), crate::types::HostKind::Operation);
    }

    #[test]
    fn builds_hl7_service_host_with_frame_handler() {
        let registry = builtin_registry();
        let host_settings = HostSettings::HlService {
            message_schema_category: "hl7".into(),
            target_config_names: vec!["Router".into()],
            ack_mode: "Immediate".into(),
            use_ack_commit_codes: false,
        };
        let adapter_settings = AdapterSettings::MllpInbound {
            port: 6661,
            stay_connected: -1,
            read_timeout_ms: 5000,
            ssl_config: None,
        };
        let ctx = HostBuildContext {
            project_id: "P".into(),
            item: item("engine.hl7.Service", Some(host_settings), Some(adapter_settings)),
            registry: Arc::new(ServiceRegistry::new()),
            trace: Arc::new(MemoryTrace::new()),
        };
        let built = registry.resolve(ctx).unwrap();
        assert_eq!(built.host.kind(), crate::types::HostKind::Service);
        assert!(built.frame_handler.is_some());
    }
}
