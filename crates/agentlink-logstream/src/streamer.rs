//! Resumable log streaming
//!
//! A stream first sends every stored entry after the caller's cursor, then,
//! when following, keeps pushing new entries as they are stored until the
//! agent leaves its workspace's latest build or the caller cancels.
//!
//! Following runs as a producer task and the calling task as its consumer:
//!
//! ```text
//! pubsub (log notify, workspace events) ──► producer ──► mpsc(8) ──► consumer ──► sink
//!                        recheck timer ──┘
//! ```
//!
//! The producer re-queries the store on every trigger and blocks when the
//! channel is full, so a slow sink throttles fetching instead of buffering.

use agentlink_control::{AgentDirectory, DirectoryError};
use agentlink_proto::{
    logs_notify_topic, workspace_event_topic, LogEntry, WorkspaceEvent, WorkspaceEventKind,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pubsub::{Handler, Pubsub, PubsubError};
use crate::store::{LogStore, LogStoreError};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Cursor must be an integer greater than or equal to zero, got {0}")]
    InvalidCursor(i64),

    #[error("Log store error: {0}")]
    Store(#[from] LogStoreError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Failed to subscribe: {0}")]
    Subscribe(#[from] PubsubError),

    #[error("Log sink closed")]
    SinkClosed,

    #[error("Log producer failed: {0}")]
    Producer(String),
}

/// How a stream ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Not following; the initial batch was sent
    Completed,
    /// The agent is no longer part of its workspace's latest build
    AgentLeftBuild,
    Cancelled,
}

/// Receiver of log batches for one stream
#[async_trait]
pub trait LogSink: Send {
    async fn send(&mut self, batch: Vec<LogEntry>) -> Result<(), StreamError>;
}

#[async_trait]
impl LogSink for mpsc::Sender<Vec<LogEntry>> {
    async fn send(&mut self, batch: Vec<LogEntry>) -> Result<(), StreamError> {
        mpsc::Sender::send(self, batch)
            .await
            .map_err(|_| StreamError::SinkClosed)
    }
}

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Re-query at least this often in case a notification was missed
    pub recheck_interval: Duration,
    /// Batches fetched ahead of the sink
    pub buffer_capacity: usize,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            recheck_interval: Duration::from_secs(60),
            buffer_capacity: 8,
        }
    }
}

pub struct LogStreamer {
    store: Arc<dyn LogStore>,
    pubsub: Arc<dyn Pubsub>,
    directory: Arc<dyn AgentDirectory>,
    config: StreamerConfig,
}

impl LogStreamer {
    pub fn new(
        store: Arc<dyn LogStore>,
        pubsub: Arc<dyn Pubsub>,
        directory: Arc<dyn AgentDirectory>,
        config: StreamerConfig,
    ) -> Self {
        Self {
            store,
            pubsub,
            directory,
            config,
        }
    }

    /// Stream the logs of `agent_id` with ids greater than `after` into `sink`
    ///
    /// Returns only after the producer task has exited and both
    /// subscriptions are released.
    pub async fn stream(
        &self,
        agent_id: Uuid,
        after: i64,
        follow: bool,
        sink: &mut dyn LogSink,
        cancel: CancellationToken,
    ) -> Result<StreamEnd, StreamError> {
        if after < 0 {
            return Err(StreamError::InvalidCursor(after));
        }

        let logs = self.store.query_after(agent_id, after).await?;
        let last_sent = logs.last().map_or(after, |entry| entry.id);
        sink.send(logs).await?;

        if !follow {
            return Ok(StreamEnd::Completed);
        }

        let workspace_id = self.directory.get_agent(agent_id).await?.workspace_id;

        // Pre-armed so entries stored between the first fetch and the
        // subscription are picked up right away.
        let log_notify = Arc::new(Notify::new());
        log_notify.notify_one();
        let build_notify = Arc::new(Notify::new());

        let workspace_subscription = self
            .pubsub
            .subscribe(
                &workspace_event_topic(workspace_id),
                state_change_handler(workspace_id, build_notify.clone()),
            )
            .await?;
        let logs_subscription = self
            .pubsub
            .subscribe(&logs_notify_topic(agent_id), wake_handler(log_notify.clone()))
            .await?;

        let (tx, mut rx) = mpsc::channel(self.config.buffer_capacity.max(1));
        let producer_cancel = cancel.child_token();
        let producer = tokio::spawn(
            Producer {
                store: self.store.clone(),
                directory: self.directory.clone(),
                agent_id,
                workspace_id,
                last_sent,
                recheck_interval: self.config.recheck_interval,
                log_notify,
                build_notify,
                tx,
                cancel: producer_cancel.clone(),
            }
            .run(),
        );

        let consumed = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(StreamEnd::Cancelled),

                batch = rx.recv() => match batch {
                    Some(Ok(logs)) => {
                        tokio::select! {
                            _ = cancel.cancelled() => break Ok(StreamEnd::Cancelled),
                            sent = sink.send(logs) => {
                                if let Err(e) = sent {
                                    break Err(e);
                                }
                            }
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None if cancel.is_cancelled() => break Ok(StreamEnd::Cancelled),
                    None => break Ok(StreamEnd::AgentLeftBuild),
                },
            }
        };

        producer_cancel.cancel();
        drop(rx);
        let joined = producer.await;

        drop(logs_subscription);
        drop(workspace_subscription);
        debug!(agent_id = %agent_id, "Log stream finished");

        match (consumed, joined) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(StreamError::Producer(e.to_string())),
            (Ok(end), Ok(())) => Ok(end),
        }
    }
}

fn wake_handler(notify: Arc<Notify>) -> Handler {
    // The payload is not needed; the producer tracks its own cursor.
    Arc::new(move |_: &[u8]| notify.notify_one())
}

fn state_change_handler(workspace_id: Uuid, notify: Arc<Notify>) -> Handler {
    Arc::new(move |message: &[u8]| {
        let Ok(event) = serde_json::from_slice::<WorkspaceEvent>(message) else {
            return;
        };
        if event.kind == WorkspaceEventKind::StateChange && event.workspace_id == workspace_id {
            notify.notify_one();
        }
    })
}

struct Producer {
    store: Arc<dyn LogStore>,
    directory: Arc<dyn AgentDirectory>,
    agent_id: Uuid,
    workspace_id: Uuid,
    last_sent: i64,
    recheck_interval: Duration,
    log_notify: Arc<Notify>,
    build_notify: Arc<Notify>,
    tx: mpsc::Sender<Result<Vec<LogEntry>, StreamError>>,
    cancel: CancellationToken,
}

impl Producer {
    async fn run(mut self) {
        let agent_id = self.agent_id;
        debug!(agent_id = %agent_id, last_sent = self.last_sent, "Start log streaming loop");

        let mut recheck = tokio::time::interval_at(
            Instant::now() + self.recheck_interval,
            self.recheck_interval,
        );

        let mut keep_going = true;
        while keep_going {
            let (triggered_by, only_check_build) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = recheck.tick() => ("timer", false),
                _ = self.build_notify.notified() => ("workspace", true),
                _ = self.log_notify.notified() => {
                    recheck.reset();
                    ("log", false)
                }
            };

            keep_going = match self
                .directory
                .list_agents_for_latest_build(self.workspace_id)
                .await
            {
                Ok(agents) => agents.iter().any(|agent| agent.id == agent_id),
                Err(e) => {
                    warn!(agent_id = %agent_id, "Failed to get agents in latest build: {}", e);
                    continue;
                }
            };

            debug!(
                agent_id = %agent_id,
                triggered_by = triggered_by,
                keep_going = keep_going,
                last_sent = self.last_sent,
                "Checking for new logs"
            );

            if only_check_build && keep_going {
                continue;
            }

            let logs = match self.store.query_after(agent_id, self.last_sent).await {
                Ok(logs) => logs,
                Err(e) => {
                    let _ = self.tx.send(Err(e.into())).await;
                    break;
                }
            };
            let Some(newest) = logs.last().map(|entry| entry.id) else {
                continue;
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                sent = self.tx.send(Ok(logs)) => {
                    if sent.is_err() {
                        break;
                    }
                    self.last_sent = newest;
                }
            }
        }

        debug!(agent_id = %agent_id, "End log streaming loop");
    }
}

#[cfg(test)]
mod tests;
