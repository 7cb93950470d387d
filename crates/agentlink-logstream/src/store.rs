//! Persisted agent logs

use agentlink_proto::{LogEntry, NewLogEntry};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use uuid::Uuid;

/// Default cap on stored output per agent (1 MiB)
pub const DEFAULT_MAX_LOG_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("Log limit of {limit} bytes exceeded for agent {agent_id}")]
    LimitExceeded { agent_id: Uuid, limit: usize },

    #[error("Log store unavailable: {0}")]
    Unavailable(String),
}

/// Ordered, append-only log storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Insert a batch, returning the stored entries in id order
    ///
    /// The batch is rejected as a whole if it would push the agent's stored
    /// output past the store's limit.
    async fn insert_batch(
        &self,
        agent_id: Uuid,
        source_id: Uuid,
        entries: Vec<NewLogEntry>,
    ) -> Result<Vec<LogEntry>, LogStoreError>;

    /// Entries with an id strictly greater than `after`, in id order
    async fn query_after(&self, agent_id: Uuid, after: i64) -> Result<Vec<LogEntry>, LogStoreError>;

    /// Bytes of output stored for the agent
    async fn logs_length(&self, agent_id: Uuid) -> Result<usize, LogStoreError>;

    async fn logs_overflowed(&self, agent_id: Uuid) -> Result<bool, LogStoreError>;

    /// Mark the agent's log as truncated. Returns `true` only for the call
    /// that changed the flag.
    async fn set_logs_overflowed(&self, agent_id: Uuid) -> Result<bool, LogStoreError>;
}

#[derive(Debug, Default)]
struct AgentLogs {
    entries: Vec<LogEntry>,
    length: usize,
    overflowed: bool,
}

#[derive(Debug, Default)]
struct Logs {
    last_id: i64,
    agents: HashMap<Uuid, AgentLogs>,
}

/// In-memory log store
/// All data is lost when the process exits.
#[derive(Debug)]
pub struct InMemoryLogStore {
    logs: Mutex<Logs>,
    max_bytes: usize,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_LOG_BYTES)
    }

    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            logs: Mutex::new(Logs::default()),
            max_bytes,
        }
    }
}

impl Default for InMemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn insert_batch(
        &self,
        agent_id: Uuid,
        source_id: Uuid,
        entries: Vec<NewLogEntry>,
    ) -> Result<Vec<LogEntry>, LogStoreError> {
        let batch_length: usize = entries.iter().map(|e| e.output.len()).sum();
        let created_at = Utc::now();

        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        let stored_length = logs.agents.get(&agent_id).map_or(0, |a| a.length);
        if stored_length + batch_length > self.max_bytes {
            return Err(LogStoreError::LimitExceeded {
                agent_id,
                limit: self.max_bytes,
            });
        }

        let first_id = logs.last_id + 1;
        logs.last_id += entries.len() as i64;

        let inserted: Vec<LogEntry> = entries
            .into_iter()
            .zip(first_id..)
            .map(|(entry, id)| LogEntry {
                id,
                created_at,
                level: entry.level,
                source_id,
                output: entry.output,
            })
            .collect();

        let agent = logs.agents.entry(agent_id).or_default();
        agent.length += batch_length;
        agent.entries.extend(inserted.iter().cloned());
        Ok(inserted)
    }

    async fn query_after(&self, agent_id: Uuid, after: i64) -> Result<Vec<LogEntry>, LogStoreError> {
        let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(agent) = logs.agents.get(&agent_id) else {
            return Ok(Vec::new());
        };
        let start = agent.entries.partition_point(|e| e.id <= after);
        Ok(agent.entries[start..].to_vec())
    }

    async fn logs_length(&self, agent_id: Uuid) -> Result<usize, LogStoreError> {
        let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(logs.agents.get(&agent_id).map_or(0, |a| a.length))
    }

    async fn logs_overflowed(&self, agent_id: Uuid) -> Result<bool, LogStoreError> {
        let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(logs.agents.get(&agent_id).is_some_and(|a| a.overflowed))
    }

    async fn set_logs_overflowed(&self, agent_id: Uuid) -> Result<bool, LogStoreError> {
        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        let agent = logs.agents.entry(agent_id).or_default();
        let changed = !agent.overflowed;
        agent.overflowed = true;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentlink_proto::LogLevel;

    fn batch(lines: &[&str]) -> Vec<NewLogEntry> {
        lines.iter().map(|l| NewLogEntry::info(*l)).collect()
    }

    #[tokio::test]
    async fn test_ids_increase_across_batches() {
        let store = InMemoryLogStore::new();
        let agent = Uuid::new_v4();
        let source = Uuid::new_v4();

        let first = store.insert_batch(agent, source, batch(&["a", "b"])).await.unwrap();
        let second = store.insert_batch(agent, source, batch(&["c"])).await.unwrap();

        let ids: Vec<i64> = first.iter().chain(second.iter()).map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(first.iter().all(|e| e.source_id == source));
        assert_eq!(store.logs_length(agent).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_query_after_cursor() {
        let store = InMemoryLogStore::new();
        let agent = Uuid::new_v4();
        let other = Uuid::new_v4();

        store.insert_batch(agent, Uuid::nil(), batch(&["1", "2", "3"])).await.unwrap();
        store.insert_batch(other, Uuid::nil(), batch(&["x"])).await.unwrap();
        store.insert_batch(agent, Uuid::nil(), batch(&["5"])).await.unwrap();

        let after: Vec<i64> = store
            .query_after(agent, 2)
            .await
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(after, vec![3, 5]);
        assert!(store.query_after(agent, 5).await.unwrap().is_empty());
        assert!(store.query_after(Uuid::new_v4(), 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_limit_rejects_whole_batch() {
        let store = InMemoryLogStore::with_limit(8);
        let agent = Uuid::new_v4();

        store.insert_batch(agent, Uuid::nil(), batch(&["12345"])).await.unwrap();
        let result = store
            .insert_batch(
                agent,
                Uuid::nil(),
                vec![NewLogEntry::new(LogLevel::Error, "67"), NewLogEntry::info("89")],
            )
            .await;

        assert!(matches!(
            result,
            Err(LogStoreError::LimitExceeded { limit: 8, .. })
        ));
        assert_eq!(store.query_after(agent, 0).await.unwrap().len(), 1);
        assert_eq!(store.logs_length(agent).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_overflow_flag_changes_once() {
        let store = InMemoryLogStore::new();
        let agent = Uuid::new_v4();

        assert!(!store.logs_overflowed(agent).await.unwrap());
        assert!(store.set_logs_overflowed(agent).await.unwrap());
        assert!(!store.set_logs_overflowed(agent).await.unwrap());
        assert!(store.logs_overflowed(agent).await.unwrap());
    }
}
