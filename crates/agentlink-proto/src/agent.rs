//! Agent records shared between the directory, the injector and the streamer

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Liveness of an agent as last observed by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Connected,
    Disconnected,
    Unreachable,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Connected => "connected",
            AgentStatus::Disconnected => "disconnected",
            AgentStatus::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

/// A remote execution endpoint attached to a workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    /// Set for injected children, absent for provisioned agents
    pub parent_id: Option<Uuid>,
    pub name: String,
    pub status: AgentStatus,
    /// Working directory the agent starts in
    pub directory: String,
    /// Workspace this agent belongs to (children inherit it from the parent)
    pub workspace_id: Uuid,
    /// Whether the agent is part of the workspace's latest build
    pub in_latest_build: bool,
    /// Sub-environment the agent runs in, for injected children
    pub sub_environment: Option<String>,
}

impl Agent {
    /// Create a root (provisioned) agent for a workspace
    pub fn root(id: Uuid, name: impl Into<String>, workspace_id: Uuid) -> Self {
        Self {
            id,
            parent_id: None,
            name: name.into(),
            status: AgentStatus::Disconnected,
            directory: String::new(),
            workspace_id,
            in_latest_build: true,
            sub_environment: None,
        }
    }

    pub fn is_child(&self) -> bool {
        self.parent_id.is_some()
    }
}

/// Entry returned when listing the children of a parent agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildAgent {
    pub id: Uuid,
    pub name: String,
}

/// Result of creating a child agent: its id and the credential it must present
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedChildAgent {
    pub id: Uuid,
    pub auth_token: Uuid,
}
