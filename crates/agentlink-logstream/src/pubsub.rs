//! Publish/subscribe bus
//!
//! Handlers run synchronously on the publishing task and must not block;
//! the streamer only uses them to wake a waiting task.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PubsubError {
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Pubsub unavailable: {0}")]
    Unavailable(String),
}

/// Callback invoked with the raw message for every publish on a topic
pub type Handler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Active subscription; unsubscribes when dropped
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Pubsub: Send + Sync {
    async fn publish(&self, topic: &str, message: &[u8]) -> Result<(), PubsubError>;

    async fn subscribe(&self, topic: &str, handler: Handler) -> Result<Subscription, PubsubError>;
}

/// Serialize `message` as JSON and publish it
pub async fn publish_json<T: Serialize + Sync>(
    pubsub: &dyn Pubsub,
    topic: &str,
    message: &T,
) -> Result<(), PubsubError> {
    let bytes = serde_json::to_vec(message)?;
    pubsub.publish(topic, &bytes).await
}

#[derive(Default)]
struct Topics {
    next_id: u64,
    handlers: HashMap<String, HashMap<u64, Handler>>,
}

/// In-process pubsub bus
#[derive(Clone, Default)]
pub struct InMemoryPubsub {
    topics: Arc<Mutex<Topics>>,
}

impl InMemoryPubsub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .get(topic)
            .map_or(0, HashMap::len)
    }
}

fn unsubscribe(topics: &Weak<Mutex<Topics>>, topic: &str, id: u64) {
    let Some(topics) = topics.upgrade() else {
        return;
    };
    let mut topics = topics.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(handlers) = topics.handlers.get_mut(topic) {
        handlers.remove(&id);
        if handlers.is_empty() {
            topics.handlers.remove(topic);
        }
    }
}

#[async_trait]
impl Pubsub for InMemoryPubsub {
    async fn publish(&self, topic: &str, message: &[u8]) -> Result<(), PubsubError> {
        // Handlers are called outside the lock so they may publish or unsubscribe.
        let handlers: Vec<Handler> = self
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .get(topic)
            .map(|handlers| handlers.values().cloned().collect())
            .unwrap_or_default();

        debug!(topic = topic, subscribers = handlers.len(), "Publishing message");
        for handler in handlers {
            handler(message);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: Handler) -> Result<Subscription, PubsubError> {
        let id = {
            let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
            let id = topics.next_id;
            topics.next_id += 1;
            topics
                .handlers
                .entry(topic.to_string())
                .or_default()
                .insert(id, handler);
            id
        };

        let topics = Arc::downgrade(&self.topics);
        let topic = topic.to_string();
        Ok(Subscription::new(move || unsubscribe(&topics, &topic, id)))
    }
}
