use super::*;
use crate::ingest::{publish_state_change, LogIngestor, UploadedLog};
use crate::pubsub::InMemoryPubsub;
use crate::store::{InMemoryLogStore, MockLogStore};
use agentlink_control::{AgentRegistry, InMemoryAgentDirectory};
use agentlink_proto::{Agent, NewLogEntry};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    registry: AgentRegistry,
    store: Arc<InMemoryLogStore>,
    pubsub: InMemoryPubsub,
    directory: Arc<InMemoryAgentDirectory>,
    agent_id: Uuid,
    workspace_id: Uuid,
}

impl Fixture {
    fn new() -> Self {
        let registry = AgentRegistry::new();
        let workspace_id = Uuid::new_v4();
        let agent = Agent::root(Uuid::new_v4(), "main", workspace_id);
        let agent_id = agent.id;
        registry.register(agent).unwrap();

        Self {
            directory: Arc::new(InMemoryAgentDirectory::new(registry.clone(), agent_id)),
            registry,
            store: Arc::new(InMemoryLogStore::new()),
            pubsub: InMemoryPubsub::new(),
            agent_id,
            workspace_id,
        }
    }

    fn streamer(&self, config: StreamerConfig) -> Arc<LogStreamer> {
        Arc::new(LogStreamer::new(
            self.store.clone(),
            Arc::new(self.pubsub.clone()),
            self.directory.clone(),
            config,
        ))
    }

    fn ingestor(&self) -> LogIngestor {
        LogIngestor::new(
            self.store.clone(),
            Arc::new(self.pubsub.clone()),
            self.directory.clone(),
        )
    }

    async fn seed(&self, count: usize) {
        let entries = (1..=count).map(|i| NewLogEntry::info(format!("line {i}"))).collect();
        self.store
            .insert_batch(self.agent_id, Uuid::nil(), entries)
            .await
            .unwrap();
    }

    fn follow(
        &self,
        streamer: Arc<LogStreamer>,
        after: i64,
        sink_capacity: usize,
        cancel: CancellationToken,
    ) -> (
        mpsc::Receiver<Vec<LogEntry>>,
        JoinHandle<Result<StreamEnd, StreamError>>,
    ) {
        let (mut tx, rx) = mpsc::channel(sink_capacity);
        let agent_id = self.agent_id;
        let handle = tokio::spawn(async move {
            streamer.stream(agent_id, after, true, &mut tx, cancel).await
        });
        (rx, handle)
    }

    fn subscriptions(&self) -> usize {
        self.pubsub.subscriber_count(&logs_notify_topic(self.agent_id))
            + self
                .pubsub
                .subscriber_count(&workspace_event_topic(self.workspace_id))
    }
}

fn ids(batch: &[LogEntry]) -> Vec<i64> {
    batch.iter().map(|entry| entry.id).collect()
}

async fn next_batch(rx: &mut mpsc::Receiver<Vec<LogEntry>>) -> Vec<LogEntry> {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a batch")
        .expect("stream closed")
}

#[tokio::test]
async fn test_snapshot_without_follow() {
    let f = Fixture::new();
    f.seed(15).await;
    let streamer = f.streamer(StreamerConfig::default());

    let (mut tx, mut rx) = mpsc::channel(4);
    let end = streamer
        .stream(f.agent_id, 10, false, &mut tx, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(end, StreamEnd::Completed);
    assert_eq!(ids(&rx.recv().await.unwrap()), vec![11, 12, 13, 14, 15]);
    assert!(rx.try_recv().is_err());
    assert_eq!(f.subscriptions(), 0);
}

#[tokio::test]
async fn test_empty_initial_batch_is_sent() {
    let f = Fixture::new();
    let streamer = f.streamer(StreamerConfig::default());

    let (mut tx, mut rx) = mpsc::channel(4);
    streamer
        .stream(f.agent_id, 0, false, &mut tx, CancellationToken::new())
        .await
        .unwrap();

    assert!(rx.recv().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_negative_cursor_rejected() {
    let f = Fixture::new();
    let streamer = f.streamer(StreamerConfig::default());

    let (mut tx, _rx) = mpsc::channel(1);
    let result = streamer
        .stream(f.agent_id, -1, true, &mut tx, CancellationToken::new())
        .await;

    assert!(matches!(result, Err(StreamError::InvalidCursor(-1))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_follow_resumes_after_cursor_until_agent_leaves_build() {
    let f = Fixture::new();
    f.seed(15).await;
    let streamer = f.streamer(StreamerConfig::default());

    let (mut rx, handle) = f.follow(streamer, 10, 4, CancellationToken::new());
    assert_eq!(ids(&next_batch(&mut rx).await), vec![11, 12, 13, 14, 15]);

    f.ingestor()
        .append(
            f.agent_id,
            Uuid::nil(),
            vec![UploadedLog::new("info", "16"), UploadedLog::new("warn", "17")],
        )
        .await
        .unwrap();
    assert_eq!(ids(&next_batch(&mut rx).await), vec![16, 17]);

    // A state change that keeps the agent in the build changes nothing.
    publish_state_change(&f.pubsub, f.workspace_id).await.unwrap();

    f.registry.mark_latest_build(f.agent_id, false);
    publish_state_change(&f.pubsub, f.workspace_id).await.unwrap();

    let end = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
    assert_eq!(end, StreamEnd::AgentLeftBuild);
    assert!(rx.recv().await.is_none());
    assert_eq!(f.subscriptions(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_releases_subscriptions() {
    let f = Fixture::new();
    let streamer = f.streamer(StreamerConfig::default());
    let cancel = CancellationToken::new();

    let (mut rx, handle) = f.follow(streamer, 0, 4, cancel.clone());
    assert!(next_batch(&mut rx).await.is_empty());

    // Wait for both subscriptions before cancelling
    tokio::time::timeout(WAIT, async {
        while f.subscriptions() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    let end = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();

    assert_eq!(end, StreamEnd::Cancelled);
    assert_eq!(f.subscriptions(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_slow_sink_sees_every_entry_once_in_order() {
    let f = Fixture::new();
    let streamer = f.streamer(StreamerConfig {
        buffer_capacity: 2,
        ..StreamerConfig::default()
    });
    let cancel = CancellationToken::new();
    let (mut rx, handle) = f.follow(streamer, 0, 1, cancel.clone());

    let ingestor = f.ingestor();
    let agent_id = f.agent_id;
    let writer = tokio::spawn(async move {
        for i in 0..50 {
            ingestor
                .append(agent_id, Uuid::nil(), vec![UploadedLog::new("info", i.to_string())])
                .await
                .unwrap();
            tokio::task::yield_now().await;
        }
    });

    let mut received = Vec::new();
    while received.len() < 50 {
        let batch = next_batch(&mut rx).await;
        received.extend(ids(&batch));
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    writer.await.unwrap();

    assert_eq!(received, (1..=50).collect::<Vec<i64>>());

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_recheck_timer_catches_missed_notifications() {
    let f = Fixture::new();
    let streamer = f.streamer(StreamerConfig::default());
    let cancel = CancellationToken::new();

    let (mut rx, handle) = f.follow(streamer, 0, 4, cancel.clone());
    assert!(rx.recv().await.unwrap().is_empty());
    // Let the pre-armed check run before storing anything
    tokio::time::sleep(Duration::from_millis(1)).await;

    // Stored without a notification; only the timer will find it.
    let started = Instant::now();
    f.seed(3).await;
    let batch = rx.recv().await.unwrap();
    assert_eq!(ids(&batch), vec![1, 2, 3]);
    assert!(started.elapsed() >= Duration::from_secs(59));

    cancel.cancel();
    assert_eq!(handle.await.unwrap().unwrap(), StreamEnd::Cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_failure_ends_stream_with_error() {
    let f = Fixture::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut store = MockLogStore::new();
    let counted = calls.clone();
    store.expect_query_after().returning(move |_, _| {
        if counted.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(Vec::new())
        } else {
            Err(LogStoreError::Unavailable("database is down".to_string()))
        }
    });

    let streamer = Arc::new(LogStreamer::new(
        Arc::new(store),
        Arc::new(f.pubsub.clone()),
        f.directory.clone(),
        StreamerConfig::default(),
    ));
    let (_rx, handle) = f.follow(streamer, 0, 4, CancellationToken::new());

    let result = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(StreamError::Store(LogStoreError::Unavailable(_)))
    ));
    assert_eq!(f.subscriptions(), 0);
}

#[tokio::test]
async fn test_closed_sink_ends_stream() {
    let f = Fixture::new();
    f.seed(1).await;
    let streamer = f.streamer(StreamerConfig::default());

    let (mut tx, rx) = mpsc::channel(1);
    drop(rx);
    let result = streamer
        .stream(f.agent_id, 0, true, &mut tx, CancellationToken::new())
        .await;

    assert!(matches!(result, Err(StreamError::SinkClosed)));
    assert_eq!(f.subscriptions(), 0);
}
