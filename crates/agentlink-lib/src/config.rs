//! Configuration for an agentlink deployment
//!
//! Every field has a default, so an empty document is a valid configuration.
//! Durations are written as whole seconds.

use agentlink_control::InjectorConfig;
use agentlink_logstream::{StreamerConfig, DEFAULT_MAX_LOG_BYTES};
use agentlink_proto::WORKSPACE_DIRECTORY_LABEL;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Serialize a [`Duration`] as whole seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentlinkConfig {
    #[serde(default)]
    pub agent: AgentSection,

    #[serde(default)]
    pub injector: InjectorSection,

    #[serde(default)]
    pub broker: BrokerSection,

    #[serde(default)]
    pub exec: ExecSection,

    #[serde(default)]
    pub forward: ForwardSection,

    #[serde(default)]
    pub logs: LogsSection,
}

/// The agent this process runs as
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSection {
    /// Parent agent id (generated at startup if unset)
    pub id: Option<Uuid>,

    /// Owning workspace id (generated at startup if unset)
    pub workspace_id: Option<Uuid>,

    #[serde(default = "default_agent_name")]
    pub name: String,

    /// Working directory reported for the parent agent
    #[serde(default)]
    pub directory: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: None,
            workspace_id: None,
            name: default_agent_name(),
            directory: String::new(),
        }
    }
}

fn default_agent_name() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectorSection {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_injector_interval", with = "duration_secs")]
    pub interval: Duration,

    /// Control plane URL handed to injected agents
    #[serde(default)]
    pub access_url: String,

    /// Local payload to inject; takes precedence over `bootstrap_url`
    pub bootstrap_path: Option<PathBuf>,

    /// Download URL for the payload (derived from `access_url` if unset)
    pub bootstrap_url: Option<String>,

    /// Where a downloaded payload is cached
    #[serde(default = "default_bootstrap_cache")]
    pub bootstrap_cache: PathBuf,

    #[serde(default = "default_payload_dest")]
    pub payload_dest: String,

    #[serde(default = "default_directory_label")]
    pub directory_label: String,

    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,
}

impl Default for InjectorSection {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_injector_interval(),
            access_url: String::new(),
            bootstrap_path: None,
            bootstrap_url: None,
            bootstrap_cache: default_bootstrap_cache(),
            payload_dest: default_payload_dest(),
            directory_label: default_directory_label(),
            docker_binary: default_docker_binary(),
        }
    }
}

impl InjectorSection {
    pub fn injector_config(&self) -> InjectorConfig {
        InjectorConfig {
            interval: self.interval,
            access_url: self.access_url.clone(),
            payload_dest: self.payload_dest.clone(),
            directory_label: self.directory_label.clone(),
        }
    }
}

fn default_injector_interval() -> Duration {
    InjectorConfig::default().interval
}

fn default_bootstrap_cache() -> PathBuf {
    std::env::temp_dir().join("agentlink-bootstrap")
}

fn default_payload_dest() -> String {
    InjectorConfig::default().payload_dest
}

fn default_directory_label() -> String {
    WORKSPACE_DIRECTORY_LABEL.to_string()
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerSection {
    /// How long to wait for an agent's tunnel to become reachable
    #[serde(default = "default_reachable_timeout", with = "duration_secs")]
    pub reachable_timeout: Duration,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            reachable_timeout: default_reachable_timeout(),
        }
    }
}

fn default_reachable_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecSection {
    /// Grace period for output readers after a background command exits
    #[serde(default = "default_drain_timeout", with = "duration_secs")]
    pub drain_timeout: Duration,
}

impl Default for ExecSection {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
        }
    }
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardSection {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
}

impl Default for ForwardSection {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
        }
    }
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogsSection {
    #[serde(default = "default_max_bytes")]
    pub max_bytes_per_agent: usize,

    #[serde(default = "default_recheck_interval", with = "duration_secs")]
    pub recheck_interval: Duration,

    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

impl Default for LogsSection {
    fn default() -> Self {
        Self {
            max_bytes_per_agent: default_max_bytes(),
            recheck_interval: default_recheck_interval(),
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

impl LogsSection {
    pub fn streamer_config(&self) -> StreamerConfig {
        StreamerConfig {
            recheck_interval: self.recheck_interval,
            buffer_capacity: self.buffer_capacity,
        }
    }
}

fn default_max_bytes() -> usize {
    DEFAULT_MAX_LOG_BYTES
}

fn default_recheck_interval() -> Duration {
    StreamerConfig::default().recheck_interval
}

fn default_buffer_capacity() -> usize {
    StreamerConfig::default().buffer_capacity
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: AgentlinkConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, AgentlinkConfig::default());
        assert_eq!(config.injector.interval, Duration::from_secs(10));
        assert_eq!(config.broker.reachable_timeout, Duration::from_secs(30));
        assert_eq!(config.logs.buffer_capacity, 8);
        assert_eq!(config.forward.bind_host, "127.0.0.1");
    }

    #[test]
    fn test_partial_sections() {
        let yaml = r#"
injector:
  enabled: true
  interval: 3
  access_url: https://control.example.com
logs:
  recheck_interval: 15
"#;
        let config: AgentlinkConfig = serde_yaml::from_str(yaml).unwrap();

        assert!(config.injector.enabled);
        let injector = config.injector.injector_config();
        assert_eq!(injector.interval, Duration::from_secs(3));
        assert_eq!(injector.access_url, "https://control.example.com");
        assert_eq!(injector.directory_label, WORKSPACE_DIRECTORY_LABEL);

        let streamer = config.logs.streamer_config();
        assert_eq!(streamer.recheck_interval, Duration::from_secs(15));
        assert_eq!(streamer.buffer_capacity, 8);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<AgentlinkConfig, _> = serde_yaml::from_str("broker:\n  timeout: 3\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_durations_serialize_as_seconds() {
        let json = serde_json::to_value(BrokerSection::default()).unwrap();
        assert_eq!(json["reachable_timeout"], 30);
    }
}
