//! Log uploads from agents

use agentlink_control::{AgentDirectory, DirectoryError};
use agentlink_proto::{
    logs_notify_topic, workspace_event_topic, LogEntry, LogLevel, LogsNotifyMessage,
    NewLogEntry, ProtoError, WorkspaceEvent, WorkspaceEventKind, EXTERNAL_LOG_SOURCE_ID,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pubsub::{publish_json, Pubsub, PubsubError};
use crate::store::{LogStore, LogStoreError};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("No logs provided")]
    EmptyBatch,

    #[error("Invalid log level: {0}")]
    InvalidLevel(#[from] ProtoError),

    #[error("Logs limit exceeded for agent {0}")]
    LimitExceeded(Uuid),

    #[error("Log store error: {0}")]
    Store(#[from] LogStoreError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Pubsub error: {0}")]
    Pubsub(#[from] PubsubError),
}

/// A log line as sent by an agent; the level may be empty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedLog {
    #[serde(default)]
    pub level: String,
    pub output: String,
}

impl UploadedLog {
    pub fn new(level: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            output: output.into(),
        }
    }
}

/// Stores agent log batches and publishes the matching notifications
pub struct LogIngestor {
    store: Arc<dyn LogStore>,
    pubsub: Arc<dyn Pubsub>,
    directory: Arc<dyn AgentDirectory>,
}

impl LogIngestor {
    pub fn new(
        store: Arc<dyn LogStore>,
        pubsub: Arc<dyn Pubsub>,
        directory: Arc<dyn AgentDirectory>,
    ) -> Self {
        Self {
            store,
            pubsub,
            directory,
        }
    }

    /// Append a batch for `agent_id`
    ///
    /// A nil `source_id` stores the batch under the external log source.
    pub async fn append(
        &self,
        agent_id: Uuid,
        source_id: Uuid,
        logs: Vec<UploadedLog>,
    ) -> Result<Vec<LogEntry>, IngestError> {
        if logs.is_empty() {
            return Err(IngestError::EmptyBatch);
        }

        let entries = logs
            .into_iter()
            .map(|log| {
                let level = LogLevel::parse_or_default(&log.level)?;
                Ok(NewLogEntry::new(level, log.output))
            })
            .collect::<Result<Vec<_>, ProtoError>>()?;

        let source_id = if source_id.is_nil() {
            EXTERNAL_LOG_SOURCE_ID
        } else {
            source_id
        };

        let previous_length = self.store.logs_length(agent_id).await?;

        let inserted = match self.store.insert_batch(agent_id, source_id, entries).await {
            Ok(inserted) => inserted,
            Err(LogStoreError::LimitExceeded { limit, .. }) => {
                self.handle_overflow(agent_id, limit).await?;
                return Err(IngestError::LimitExceeded(agent_id));
            }
            Err(e) => return Err(e.into()),
        };

        // Subscribers fetch everything after this cursor.
        let lowest_id = inserted.first().map_or(0, |entry| entry.id);
        publish_json(
            self.pubsub.as_ref(),
            &logs_notify_topic(agent_id),
            &LogsNotifyMessage {
                created_after: lowest_id - 1,
            },
        )
        .await?;

        debug!(
            agent_id = %agent_id,
            count = inserted.len(),
            lowest_id = lowest_id,
            "Stored agent logs"
        );

        if previous_length == 0 {
            let agent = self.directory.get_agent(agent_id).await?;
            self.publish_workspace_event(WorkspaceEvent::for_agent(
                WorkspaceEventKind::AgentFirstLogs,
                agent.workspace_id,
                agent_id,
            ))
            .await?;
        }

        Ok(inserted)
    }

    async fn handle_overflow(&self, agent_id: Uuid, limit: usize) -> Result<(), IngestError> {
        match self.store.set_logs_overflowed(agent_id).await {
            Ok(false) => return Ok(()),
            Ok(true) => {}
            // The flag is only a hint to viewers; still tell them once.
            Err(e) => warn!(agent_id = %agent_id, "Failed to mark agent logs overflowed: {}", e),
        }

        info!(agent_id = %agent_id, limit = limit, "Agent logs overflowed");
        let agent = self.directory.get_agent(agent_id).await?;
        self.publish_workspace_event(WorkspaceEvent::for_agent(
            WorkspaceEventKind::AgentLogsOverflow,
            agent.workspace_id,
            agent_id,
        ))
        .await
    }

    async fn publish_workspace_event(&self, event: WorkspaceEvent) -> Result<(), IngestError> {
        publish_json(
            self.pubsub.as_ref(),
            &workspace_event_topic(event.workspace_id),
            &event,
        )
        .await?;
        Ok(())
    }
}

/// Announce that the latest build of `workspace_id` changed
pub async fn publish_state_change(
    pubsub: &dyn Pubsub,
    workspace_id: Uuid,
) -> Result<(), PubsubError> {
    publish_json(
        pubsub,
        &workspace_event_topic(workspace_id),
        &WorkspaceEvent::state_change(workspace_id),
    )
    .await
}
