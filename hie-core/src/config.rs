//! Typed deserialisation of the §6.2 item/settings configuration tree.
//!
//! A production's configuration is, on the wire, a format-agnostic tree
//! (YAML/JSON/XML); this core only needs one concrete shape to work with,
//! so it deserialises YAML via `serde_yaml` into the structs below: typed
//! struct + `from_yaml_str` + `#[serde(default)]` everywhere an item may
//! omit a Phase-2 field.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{ExecutionMode, MessagingPattern, OverflowPolicy, QueueType, RestartPolicy};

fn default_pool_size() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_execution_mode() -> ExecutionMode {
    ExecutionMode::Cooperative
}

fn default_queue_type() -> QueueType {
    QueueType::Fifo
}

fn default_queue_size() -> usize {
    1000
}

fn default_overflow_strategy() -> OverflowPolicy {
    OverflowPolicy::Block
}

fn default_restart_policy() -> RestartPolicy {
    RestartPolicy::OnFailure
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_messaging_pattern() -> MessagingPattern {
    MessagingPattern::AsyncReliable
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

/// The whole tree: one production, many items (§6.2).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProductionConfig {
    pub project_id: String,
    #[serde(default)]
    pub items: Vec<HostItemConfig>,
}

impl ProductionConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

/// Item-level configuration (§6.2 "Item-level").
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostItemConfig {
    pub name: String,
    pub class_name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub foreground: bool,
    #[serde(default)]
    pub log_trace_events: bool,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub comment: String,

    #[serde(default = "default_execution_mode")]
    pub execution_mode: ExecutionMode,
    #[serde(default = "default_pool_size")]
    pub worker_count: u32,
    #[serde(default = "default_queue_type")]
    pub queue_type: QueueType,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_overflow_strategy")]
    pub overflow_strategy: OverflowPolicy,
    #[serde(default = "default_restart_policy")]
    pub restart_policy: RestartPolicy,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_messaging_pattern")]
    pub messaging_pattern: MessagingPattern,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    #[serde(default)]
    pub target_config_names: Vec<String>,

    #[serde(default)]
    pub adapter: Option<AdapterSettings>,
    #[serde(default)]
    pub host: Option<HostSettings>,
}

impl HostItemConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }
}

/// `adapter.*` settings, keyed per adapter kind (§6.2). Opaque to the host.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterSettings {
    MllpInbound {
        port: u16,
        #[serde(default)]
        stay_connected: i32,
        #[serde(default = "default_message_timeout_ms")]
        read_timeout_ms: u64,
        #[serde(default)]
        ssl_config: Option<SslSettings>,
    },
    MllpOutbound {
        ip_address: String,
        port: u16,
        #[serde(default = "default_message_timeout_ms")]
        connect_timeout_ms: u64,
        #[serde(default = "default_message_timeout_ms")]
        response_timeout_ms: u64,
        #[serde(default = "default_max_restarts")]
        reconnect_retry: u32,
        #[serde(default)]
        stay_connected: i32,
        #[serde(default)]
        local_interface: Option<String>,
        #[serde(default)]
        ssl_config: Option<SslSettings>,
    },
    HttpInbound {
        port: u16,
        base_path: String,
        #[serde(default)]
        allowed_methods: Vec<String>,
        #[serde(default)]
        max_body_size: usize,
        #[serde(default)]
        enable_cors: bool,
        #[serde(default)]
        ssl_config: Option<SslSettings>,
    },
    HttpOutbound {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
        #[serde(default = "default_content_type")]
        content_type: String,
        #[serde(default)]
        custom_headers: HashMap<String, String>,
        #[serde(default)]
        ssl_config: Option<SslSettings>,
    },
    FileInbound {
        file_path: String,
        file_spec: String,
        #[serde(default = "default_message_timeout_ms")]
        poll_interval_ms: u64,
        #[serde(default)]
        archive_path: Option<String>,
        work_path: String,
        error_path: String,
        #[serde(default)]
        semaphore_spec: Option<String>,
    },
    FileOutbound {
        file_path: String,
        filename_template: String,
        #[serde(default)]
        overwrite: bool,
    },
}

fn default_http_method() -> String {
    "POST".to_string()
}

fn default_content_type() -> String {
    "application/hl7-v2".to_string()
}

/// Pass-through SSL fields (§6.2): round-tripped but never acted on.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SslSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_path: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
}

/// `host.*` settings, keyed per host kind (§6.2). Consumed by the host code.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostSettings {
    HlService {
        message_schema_category: String,
        #[serde(default)]
        target_config_names: Vec<String>,
        #[serde(default = "default_ack_mode")]
        ack_mode: String,
        #[serde(default)]
        use_ack_commit_codes: bool,
    },
    RoutingProcess {
        #[serde(default)]
        business_rule_name: Option<String>,
        #[serde(default)]
        validation_schema: Option<String>,
        #[serde(default)]
        rule_logging: bool,
    },
    HlOperation {
        reply_code_actions: String,
        #[serde(default)]
        archive_io: bool,
        #[serde(default = "default_message_timeout_ms")]
        failure_timeout_ms: u64,
        #[serde(default = "default_message_timeout_ms")]
        retry_interval_ms: u64,
    },
}

fn default_ack_mode() -> String {
    "App".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_production_with_one_service_item() {
        let yaml = r#"
project_id: HOSP-PROD
items:
  - name: PAS-In
    class_name: engine.hl7.Service
    target_config_names: [Router]
    adapter:
      kind: mllp_inbound
      port: 6661
    host:
      kind: hl_service
      message_schema_category: hl7
      ack_mode: Immediate
"#;
        let cfg = ProductionConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.project_id, "HOSP-PROD");
        assert_eq!(cfg.items.len(), 1);
        let item = &cfg.items[0];
        assert_eq!(item.pool_size, 1);
        assert!(item.enabled);
        assert!(matches!(item.adapter, Some(AdapterSettings::MllpInbound { port: 6661, .. })));
        assert!(matches!(item.host, Some(HostSettings::HlService { .. })));
    }

    #[test]
    fn ssl_config_round_trips_without_being_required() {
        let yaml = r#"
project_id: P
items:
  - name: Lab-Out
    class_name: engine.hl7.Operation
    adapter:
      kind: mllp_outbound
      ip_address: 10.0.0.5
      port: 6662
      ssl_config:
        enabled: true
        cert_path: /etc/hie/cert.pem
    host:
      kind: hl_operation
      reply_code_actions: "AA=C,*=S"
"#;
        let cfg = ProductionConfig::from_yaml_str(yaml).unwrap();
        let AdapterSettings::MllpOutbound { ssl_config, .. } = cfg.items[0].adapter.clone().unwrap() else {
            panic!("expected MllpOutbound");
        };
        assert!(ssl_config.unwrap().enabled);
    }
}
