//! Typed tool request/response schema
//!
//! Requests arrive as `{"tool": "<name>", "arguments": {...}}` and are decoded
//! exactly once at the boundary. Unknown tools, unknown or missing arguments
//! and mistyped values are decode errors; nothing falls back to a zero value.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::command::{CommandState, CommandSummary};

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Invalid tool request: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid log level: {0:?}")]
    InvalidLogLevel(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ExecuteCommandArgs {
    pub workspace_agent_id: Uuid,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AsyncCommandRef {
    pub command_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct WriteStdinArgs {
    pub command_id: Uuid,
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StartPortForwardArgs {
    pub workspace_agent_id: Uuid,
    pub local_port: u16,
    pub remote_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StopPortForwardArgs {
    pub local_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "tool",
    content = "arguments",
    rename_all = "kebab-case",
    deny_unknown_fields
)]
pub enum ToolRequest {
    /// Run a command to completion and return its combined output
    ExecuteCommandSync(ExecuteCommandArgs),
    /// Start a command in the background and return its job id
    ExecuteCommandAsync(ExecuteCommandArgs),
    AsyncCommandOutput(AsyncCommandRef),
    AsyncCommandStatus(AsyncCommandRef),
    AsyncCommandKill(AsyncCommandRef),
    AsyncCommandWriteStdin(WriteStdinArgs),
    AsyncCommandList,
    StartPortForward(StartPortForwardArgs),
    StopPortForward(StopPortForwardArgs),
    ListPortForwards,
}

impl ToolRequest {
    pub fn from_json(raw: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Wire name of the tool, used in logs
    pub fn name(&self) -> &'static str {
        match self {
            ToolRequest::ExecuteCommandSync(_) => "execute-command-sync",
            ToolRequest::ExecuteCommandAsync(_) => "execute-command-async",
            ToolRequest::AsyncCommandOutput(_) => "async-command-output",
            ToolRequest::AsyncCommandStatus(_) => "async-command-status",
            ToolRequest::AsyncCommandKill(_) => "async-command-kill",
            ToolRequest::AsyncCommandWriteStdin(_) => "async-command-write-stdin",
            ToolRequest::AsyncCommandList => "async-command-list",
            ToolRequest::StartPortForward(_) => "start-port-forward",
            ToolRequest::StopPortForward(_) => "stop-port-forward",
            ToolRequest::ListPortForwards => "list-port-forwards",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardSummary {
    pub agent_id: Uuid,
    pub local_port: u16,
    pub remote_port: u16,
    pub local_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResponse {
    CommandOutput {
        output: String,
        exit_code: i32,
    },
    CommandStarted {
        command_id: Uuid,
    },
    AsyncOutput {
        command_id: Uuid,
        output: String,
    },
    CommandStatus {
        command_id: Uuid,
        #[serde(flatten)]
        state: CommandState,
    },
    CommandKilled {
        command_id: Uuid,
    },
    StdinWritten {
        command_id: Uuid,
        bytes: usize,
    },
    Commands {
        commands: Vec<CommandSummary>,
    },
    PortForwardStarted {
        agent_id: Uuid,
        local_port: u16,
        remote_port: u16,
    },
    PortForwardStopped {
        local_port: u16,
    },
    PortForwards {
        forwards: Vec<ForwardSummary>,
    },
}

impl ToolResponse {
    /// Human readable rendering for text-only clients
    pub fn text(&self) -> String {
        match self {
            ToolResponse::CommandOutput { output, .. } => output.clone(),
            ToolResponse::CommandStarted { command_id } => command_id.to_string(),
            ToolResponse::AsyncOutput { output, .. } => output.clone(),
            ToolResponse::CommandStatus { command_id, state } => match state {
                CommandState::Running => "Command is still running...".to_string(),
                other => format!("Command {} {}", command_id, other),
            },
            ToolResponse::CommandKilled { .. } => "Command killed.".to_string(),
            ToolResponse::StdinWritten { bytes, .. } => format!("Wrote {} bytes", bytes),
            ToolResponse::Commands { commands } => commands
                .iter()
                .map(|c| format!("Command ID: {} ({:?}) {}", c.id, c.command, c.state))
                .collect::<Vec<_>>()
                .join("\n"),
            ToolResponse::PortForwardStarted {
                local_port,
                remote_port,
                ..
            } => format!(
                "Port forward started: localhost:{} -> workspace:{}",
                local_port, remote_port
            ),
            ToolResponse::PortForwardStopped { local_port } => {
                format!("Port forward stopped on local port {}", local_port)
            }
            ToolResponse::PortForwards { forwards } => forwards
                .iter()
                .map(|f| {
                    format!(
                        "{} -> agent {} port {}",
                        f.local_address, f.agent_id, f.remote_port
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}
