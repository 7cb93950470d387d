//! Agent log storage, ingestion and streaming
//!
//! Agents upload log batches through [`LogIngestor`], which stores them in a
//! [`LogStore`] and announces them on a [`Pubsub`] bus. [`LogStreamer`]
//! serves those logs to viewers from a cursor, following new entries as the
//! notifications arrive.

pub mod ingest;
pub mod pubsub;
pub mod store;
pub mod streamer;

pub use ingest::{publish_state_change, IngestError, LogIngestor, UploadedLog};
pub use pubsub::{publish_json, Handler, InMemoryPubsub, Pubsub, PubsubError, Subscription};
pub use store::{InMemoryLogStore, LogStore, LogStoreError, DEFAULT_MAX_LOG_BYTES};
pub use streamer::{LogSink, LogStreamer, StreamEnd, StreamError, StreamerConfig};
