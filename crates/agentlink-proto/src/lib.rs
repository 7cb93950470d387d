//! Agentlink Protocol Definitions
//!
//! This crate defines the shared data model for the agent fleet: agents and
//! sub-environments, log entries and their notifications, command job states,
//! and the typed tool request/response schema exposed to RPC-style callers.

pub mod agent;
pub mod command;
pub mod events;
pub mod logs;
pub mod subenv;
pub mod tools;

pub use agent::{Agent, AgentStatus, ChildAgent, CreatedChildAgent};
pub use command::{CommandState, CommandSummary};
pub use events::{
    logs_notify_topic, workspace_event_topic, LogsNotifyMessage, WorkspaceEvent,
    WorkspaceEventKind,
};
pub use logs::{LogEntry, LogLevel, NewLogEntry, EXTERNAL_LOG_SOURCE_ID};
pub use subenv::{SubEnvironment, WORKSPACE_DIRECTORY_LABEL};
pub use tools::{
    AsyncCommandRef, ExecuteCommandArgs, ForwardSummary, ProtoError,
    StartPortForwardArgs, StopPortForwardArgs, ToolRequest, ToolResponse, WriteStdinArgs,
};
