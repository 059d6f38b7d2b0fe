//! Broker abstraction the pipeline stages consume through. Every stage
//! reads from one durable subject and publishes to the next, tracking
//! its own consumer cursor with explicit ack/nack — modeled directly on
//! NATS JetStream's durable-consumer semantics (see `nats`), with a
//! SQLite-backed queue (see `sqlite`) standing in for local development
//! and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod error;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "nats")]
pub mod nats;

pub use error::QueueError;

pub type Result<T> = std::result::Result<T, QueueError>;

/// A message on the wire between stages: an opaque JSON payload plus the
/// subject-scoped id used for idempotent publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub payload: serde_json::Value,
}

impl Message {
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// A message handed back from `poll`, with broker-assigned delivery metadata.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Message,
    pub receipt_handle: String,
    pub broker_message_id: Option<String>,
    pub queue_identifier: String,
    /// Number of times this message has been delivered before this poll
    /// returned it, i.e. 0 on first delivery. Compared against
    /// `max_deliver` to decide whether to move a message to the DLQ
    /// subject instead of nacking it again.
    pub redelivery_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub pending_messages: u64,
    pub in_flight_messages: u64,
    pub queue_identifier: String,
}

/// A durable consumer over one subject.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    fn identifier(&self) -> &str;

    /// Poll for up to `max_messages` messages.
    async fn poll(&self, max_messages: u32) -> Result<Vec<QueuedMessage>>;

    /// Acknowledge successful processing — removes the message for good.
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Negative-acknowledge: make the message visible again after `delay_seconds`,
    /// incrementing its redelivery count. Used for both transient retry and
    /// explicit backoff scheduling.
    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()>;

    /// Extend the in-flight visibility window without acking or nacking —
    /// used by long-running handlers to avoid a concurrent redelivery.
    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()>;

    fn is_healthy(&self) -> bool;

    async fn stop(&self);

    async fn get_metrics(&self) -> Result<Option<QueueMetrics>> {
        Ok(None)
    }
}

/// A publisher onto one subject.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    fn identifier(&self) -> &str;

    async fn publish(&self, message: Message) -> Result<String>;

    async fn publish_batch(&self, messages: Vec<Message>) -> Result<Vec<String>>;
}

/// Combined consumer/publisher with schema bootstrap, for the embedded
/// (SQLite) dev broker.
#[async_trait]
pub trait EmbeddedQueue: QueueConsumer + QueuePublisher {
    async fn init_schema(&self) -> Result<()>;
}
