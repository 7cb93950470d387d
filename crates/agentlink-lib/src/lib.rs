//! Agentlink Library - Public API for Rust applications coordinating an agent fleet
//!
//! This library re-exports the agentlink crates and adds the pieces that tie
//! them together: the configuration model, the [`Fleet`] wiring and the
//! RPC-style [`ToolService`].
//!
//! # Quick Start
//!
//! ```ignore
//! use agentlink_lib::{AgentlinkConfig, Fleet, LocalTunnelProvider, ToolRequest};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = Arc::new(LocalTunnelProvider::new());
//! let fleet = Fleet::new(AgentlinkConfig::default(), provider.clone())?;
//! provider.register(fleet.parent.id);
//!
//! let reply = fleet
//!     .tools
//!     .handle_json(&format!(
//!         r#"{{"tool": "execute-command-sync", "arguments": {{"workspace-agent-id": "{}", "command": "uname -a"}}}}"#,
//!         fleet.parent.id
//!     ))
//!     .await;
//! println!("{}", reply.text);
//!
//! fleet.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod fleet;
pub mod tools;

pub use config::{
    AgentSection, AgentlinkConfig, BrokerSection, ExecSection, ForwardSection, InjectorSection,
    LogsSection,
};
pub use fleet::Fleet;
pub use tools::{ToolError, ToolReply, ToolService};

// Re-export core types
pub use agentlink_proto::{
    Agent, AgentStatus, CommandState, CommandSummary, ForwardSummary, LogEntry, LogLevel,
    SubEnvironment, ToolRequest, ToolResponse, WorkspaceEvent, WorkspaceEventKind,
};

pub use agentlink_transport::{
    LocalTunnelProvider, RemoteShell, ShellSession, TransportError, Tunnel, TunnelProvider,
};

pub use agentlink_control::{
    AgentDirectory, AgentRegistry, BootstrapSource, ConnectionBroker, ContainerRuntime,
    DockerCli, DownloadBootstrap, FileBootstrap, InMemoryAgentDirectory, Injector,
    InjectorConfig, SubEnvironmentLister,
};

pub use agentlink_exec::{CommandExecutor, ExecError, RunOutput};

pub use agentlink_forward::{ForwardError, PortForwarder};

pub use agentlink_logstream::{
    publish_state_change, InMemoryLogStore, InMemoryPubsub, LogIngestor, LogSink, LogStore,
    LogStreamer, Pubsub, StreamEnd, StreamError, StreamerConfig, UploadedLog,
};
