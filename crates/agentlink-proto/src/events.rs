//! Notifications published on the pubsub bus

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Topic notified whenever a log batch for `agent_id` is persisted
pub fn logs_notify_topic(agent_id: Uuid) -> String {
    format!("agent-logs:{}", agent_id)
}

/// Topic carrying [`WorkspaceEvent`]s for one workspace
pub fn workspace_event_topic(workspace_id: Uuid) -> String {
    format!("workspace:{}", workspace_id)
}

/// Published after a log insert; subscribers may fetch everything after `created_after`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsNotifyMessage {
    pub created_after: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceEventKind {
    /// A build transition changed the set of agents in the latest build
    StateChange,
    /// An agent's log exceeded the storage limit and is truncated
    AgentLogsOverflow,
    /// An agent stored its first log batch
    AgentFirstLogs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceEvent {
    pub kind: WorkspaceEventKind,
    pub workspace_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
}

impl WorkspaceEvent {
    pub fn state_change(workspace_id: Uuid) -> Self {
        Self {
            kind: WorkspaceEventKind::StateChange,
            workspace_id,
            agent_id: None,
        }
    }

    pub fn for_agent(kind: WorkspaceEventKind, workspace_id: Uuid, agent_id: Uuid) -> Self {
        Self {
            kind,
            workspace_id,
            agent_id: Some(agent_id),
        }
    }
}
