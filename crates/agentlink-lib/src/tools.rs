//! RPC-style tool surface over the command executor and port forwarder

use agentlink_control::{BrokerError, ConnectionBroker};
use agentlink_exec::{CommandExecutor, ExecError};
use agentlink_forward::{ForwardError, PortForwarder};
use agentlink_proto::{ProtoError, ToolRequest, ToolResponse};
use agentlink_transport::{ShellSession, TransportError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error(transparent)]
    Request(#[from] ProtoError),

    #[error("Failed to connect to agent: {0}")]
    Broker(#[from] BrokerError),

    #[error("Failed to open session: {0}")]
    Session(#[from] TransportError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Forward(#[from] ForwardError),
}

/// One line of the JSON tool protocol sent back to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResponse>,
    /// Rendered result, or the error message
    pub text: String,
}

impl ToolReply {
    pub fn success(response: ToolResponse) -> Self {
        Self {
            ok: true,
            text: response.text(),
            result: Some(response),
        }
    }

    pub fn failure(error: &ToolError) -> Self {
        Self {
            ok: false,
            result: None,
            text: error.to_string(),
        }
    }
}

pub struct ToolService {
    broker: Arc<ConnectionBroker>,
    executor: Arc<CommandExecutor>,
    forwarder: Arc<PortForwarder>,
}

impl ToolService {
    pub fn new(
        broker: Arc<ConnectionBroker>,
        executor: Arc<CommandExecutor>,
        forwarder: Arc<PortForwarder>,
    ) -> Self {
        Self {
            broker,
            executor,
            forwarder,
        }
    }

    /// Decode one request line and handle it; failures become error replies
    pub async fn handle_json(&self, raw: &str) -> ToolReply {
        let result = match ToolRequest::from_json(raw) {
            Ok(request) => self.handle(request).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(response) => ToolReply::success(response),
            Err(e) => {
                debug!("Tool request failed: {}", e);
                ToolReply::failure(&e)
            }
        }
    }

    pub async fn handle(&self, request: ToolRequest) -> Result<ToolResponse, ToolError> {
        debug!(tool = request.name(), "Handling tool request");

        let response = match request {
            ToolRequest::ExecuteCommandSync(args) => {
                let session = self.open_session(args.workspace_agent_id).await?;
                let run = self.executor.run(session, &args.command).await?;
                ToolResponse::CommandOutput {
                    output: run.output,
                    exit_code: run.exit_code,
                }
            }
            ToolRequest::ExecuteCommandAsync(args) => {
                let session = self.open_session(args.workspace_agent_id).await?;
                let command_id = self.executor.start(session, &args.command).await?;
                ToolResponse::CommandStarted { command_id }
            }
            ToolRequest::AsyncCommandOutput(args) => ToolResponse::AsyncOutput {
                command_id: args.command_id,
                output: self.executor.output(args.command_id)?,
            },
            ToolRequest::AsyncCommandStatus(args) => ToolResponse::CommandStatus {
                command_id: args.command_id,
                state: self.executor.status(args.command_id)?,
            },
            ToolRequest::AsyncCommandKill(args) => {
                self.executor.kill(args.command_id).await?;
                ToolResponse::CommandKilled {
                    command_id: args.command_id,
                }
            }
            ToolRequest::AsyncCommandWriteStdin(args) => {
                let bytes = self
                    .executor
                    .write_stdin(args.command_id, args.input.as_bytes())
                    .await?;
                ToolResponse::StdinWritten {
                    command_id: args.command_id,
                    bytes,
                }
            }
            ToolRequest::AsyncCommandList => ToolResponse::Commands {
                commands: self.executor.list(),
            },
            ToolRequest::StartPortForward(args) => {
                let forward = self
                    .forwarder
                    .start(args.workspace_agent_id, args.local_port, args.remote_port)
                    .await?;
                ToolResponse::PortForwardStarted {
                    agent_id: forward.agent_id,
                    local_port: forward.local_port,
                    remote_port: forward.remote_port,
                }
            }
            ToolRequest::StopPortForward(args) => {
                self.forwarder.stop(args.local_port).await?;
                ToolResponse::PortForwardStopped {
                    local_port: args.local_port,
                }
            }
            ToolRequest::ListPortForwards => ToolResponse::PortForwards {
                forwards: self.forwarder.list(),
            },
        };
        Ok(response)
    }

    /// Open a shell session on the agent
    ///
    /// A cached shell that fails to open a session is treated as stale: the
    /// connection is discarded and redialed once.
    async fn open_session(&self, agent_id: Uuid) -> Result<Box<dyn ShellSession>, ToolError> {
        let conn = self.broker.ensure_connection(agent_id).await?;
        let shell = self.broker.ensure_shell(&conn).await?;
        match shell.new_session().await {
            Ok(session) => Ok(session),
            Err(e) => {
                warn!(agent_id = %agent_id, "Shell session failed, reconnecting: {}", e);
                self.broker.discard(agent_id).await;

                let conn = self.broker.ensure_connection(agent_id).await?;
                let shell = self.broker.ensure_shell(&conn).await?;
                Ok(shell.new_session().await?)
            }
        }
    }

    /// Stop all forwards and close all agent connections
    pub async fn shutdown(&self) {
        self.forwarder.stop_all().await;
        self.broker.close_all().await;
    }
}
