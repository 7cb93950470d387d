//! Container runtime access for the injector
//!
//! [`SubEnvironmentLister`] enumerates the containers running next to the
//! parent agent and [`ContainerRuntime`] copies files into them and runs
//! commands inside them. [`DockerCli`] implements both by shelling out to
//! the `docker` binary.

use agentlink_proto::SubEnvironment;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Failed to parse container listing: {0}")]
    Parse(String),
}

/// Captured output of a runtime command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubEnvironmentLister: Send + Sync {
    async fn list(&self) -> Result<Vec<SubEnvironment>, RuntimeError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Copy a local file to `dest` inside the container
    async fn copy_into(
        &self,
        container_id: &str,
        source: &Path,
        dest: &str,
    ) -> Result<ExecOutput, RuntimeError>;

    /// Run `argv` inside the container and wait for it
    async fn exec(&self, container_id: &str, argv: &[String]) -> Result<ExecOutput, RuntimeError>;

    /// Start `argv` inside the container without waiting for it to finish
    async fn exec_detached(
        &self,
        container_id: &str,
        env: &[(String, String)],
        argv: &[String],
    ) -> Result<ExecOutput, RuntimeError>;
}

/// Docker command line client
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<ExecOutput, RuntimeError> {
        debug!(binary = %self.binary, args = ?args, "Running container runtime command");

        let output = Command::new(&self.binary).args(args).output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command: format!("{} {}", self.binary, args.join(" ")),
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(ExecOutput { stdout, stderr })
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct DockerPsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

/// Parse `docker ps --format '{{json .}}'` output, one JSON object per line
pub fn parse_ps_output(output: &str) -> Result<Vec<SubEnvironment>, RuntimeError> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let entry: DockerPsLine =
                serde_json::from_str(line).map_err(|e| RuntimeError::Parse(e.to_string()))?;

            let friendly_name = entry.names.split(',').next().unwrap_or_default();
            let mut env = SubEnvironment::new(entry.id, friendly_name);
            // Docker joins labels as "k=v,k=v"; values containing commas are not representable.
            for pair in entry.labels.split(',').filter(|p| !p.is_empty()) {
                if let Some((key, value)) = pair.split_once('=') {
                    env = env.with_label(key, value);
                }
            }
            Ok(env)
        })
        .collect()
}

#[async_trait]
impl SubEnvironmentLister for DockerCli {
    async fn list(&self) -> Result<Vec<SubEnvironment>, RuntimeError> {
        let args = ["ps", "--no-trunc", "--format", "{{json .}}"].map(String::from);
        let output = self.run(&args).await?;
        parse_ps_output(&output.stdout)
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn copy_into(
        &self,
        container_id: &str,
        source: &Path,
        dest: &str,
    ) -> Result<ExecOutput, RuntimeError> {
        let args = vec![
            "container".to_string(),
            "cp".to_string(),
            source.display().to_string(),
            format!("{}:{}", container_id, dest),
        ];
        self.run(&args).await
    }

    async fn exec(&self, container_id: &str, argv: &[String]) -> Result<ExecOutput, RuntimeError> {
        let mut args = vec![
            "container".to_string(),
            "exec".to_string(),
            container_id.to_string(),
        ];
        args.extend_from_slice(argv);
        self.run(&args).await
    }

    async fn exec_detached(
        &self,
        container_id: &str,
        env: &[(String, String)],
        argv: &[String],
    ) -> Result<ExecOutput, RuntimeError> {
        let mut args = vec![
            "container".to_string(),
            "exec".to_string(),
            "--detach".to_string(),
        ];
        for (key, value) in env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(container_id.to_string());
        args.extend_from_slice(argv);
        self.run(&args).await
    }
}
