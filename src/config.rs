//! Configuration file loading
//!
//! Reads `~/.agentlink/config.yaml` (or the file given with `--config`) and
//! applies command line overrides on top.

use agentlink_lib::AgentlinkConfig;
use anyhow::{Context, Result};
use clap::Args;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Configuration manager
pub struct ConfigManager;

impl ConfigManager {
    /// Default config file path
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".agentlink").join("config.yaml"))
    }

    /// Load the configuration
    ///
    /// An explicitly given file must exist; a missing default file yields
    /// the default configuration.
    pub fn load(path: Option<&Path>) -> Result<AgentlinkConfig> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let path = Self::default_path()?;
                if !path.exists() {
                    return Ok(AgentlinkConfig::default());
                }
                Self::load_from(&path)
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<AgentlinkConfig> {
        let yaml = fs::read_to_string(path)
            .context(format!("Failed to read config file: {:?}", path))?;

        let config: AgentlinkConfig = serde_yaml::from_str(&yaml)
            .context(format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }
}

/// Command line values that take precedence over the config file
#[derive(Args, Debug, Clone, Default)]
pub struct Overrides {
    /// Parent agent id
    #[arg(long, env = "AGENTLINK_AGENT_ID")]
    pub agent_id: Option<Uuid>,

    /// Workspace id of the parent agent
    #[arg(long, env = "AGENTLINK_WORKSPACE_ID")]
    pub workspace_id: Option<Uuid>,

    /// Control plane URL handed to injected agents
    #[arg(long, env = "AGENTLINK_ACCESS_URL")]
    pub access_url: Option<String>,

    /// Local agent payload to inject into containers
    #[arg(long, env = "AGENTLINK_BOOTSTRAP_PATH")]
    pub bootstrap_path: Option<PathBuf>,

    /// Seconds between injector reconciliation passes
    #[arg(long, env = "AGENTLINK_INJECT_INTERVAL")]
    pub inject_interval: Option<u64>,

    /// Host that port forwards bind on
    #[arg(long, env = "AGENTLINK_BIND_HOST")]
    pub bind_host: Option<String>,
}

impl Overrides {
    pub fn apply(&self, config: &mut AgentlinkConfig) {
        if let Some(id) = self.agent_id {
            config.agent.id = Some(id);
        }
        if let Some(id) = self.workspace_id {
            config.agent.workspace_id = Some(id);
        }
        if let Some(url) = &self.access_url {
            config.injector.access_url = url.clone();
        }
        if let Some(path) = &self.bootstrap_path {
            config.injector.bootstrap_path = Some(path.clone());
        }
        if let Some(secs) = self.inject_interval {
            config.injector.interval = std::time::Duration::from_secs(secs);
        }
        if let Some(host) = &self.bind_host {
            config.forward.bind_host = host.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "injector:\n  enabled: true\n  interval: 2\nforward:\n  bind_host: 0.0.0.0\n",
        )
        .unwrap();

        let config = ConfigManager::load(Some(&path)).unwrap();

        assert!(config.injector.enabled);
        assert_eq!(config.injector.interval, Duration::from_secs(2));
        assert_eq!(config.forward.bind_host, "0.0.0.0");
        assert_eq!(config.broker.reachable_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ConfigManager::load(Some(&dir.path().join("absent.yaml"))).is_err());
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "logs: [not, a, map]\n").unwrap();

        let err = ConfigManager::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_overrides_win() {
        let mut config = AgentlinkConfig::default();
        config.forward.bind_host = "10.0.0.1".to_string();
        let agent_id = Uuid::new_v4();

        Overrides {
            agent_id: Some(agent_id),
            inject_interval: Some(30),
            bind_host: Some("127.0.0.2".to_string()),
            ..Overrides::default()
        }
        .apply(&mut config);

        assert_eq!(config.agent.id, Some(agent_id));
        assert_eq!(config.injector.interval, Duration::from_secs(30));
        assert_eq!(config.forward.bind_host, "127.0.0.2");
        assert!(config.injector.access_url.is_empty());
    }
}
