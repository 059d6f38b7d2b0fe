//! The channel-specific send boundary. Real provider SDKs (SES, Twilio,
//! FCM/APNs) are out of scope here; `Transport` is the seam a deployment
//! wires a real implementation into.

use async_trait::async_trait;
use notify_common::RenderedNotification;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport error: {0}")]
    Failed(String),
}

/// Result of attempting to hand a rendered notification to a channel
/// provider.
#[derive(Debug, Clone)]
pub enum TransportOutcome {
    /// The provider accepted the notification. `provider_message_id` is
    /// recorded on the delivery audit row's metadata when present.
    Delivered { provider_message_id: Option<String> },
    /// The provider permanently rejected the notification (invalid
    /// recipient, blocked content) — retrying will not help; move straight
    /// to the dead-letter subject.
    PreconditionFailed { reason: String },
    /// A transient failure (timeout, 5xx, connection reset) — eligible for
    /// retry with backoff.
    TransientFailure { error: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn channel(&self) -> notify_common::Channel;

    async fn send(&self, notification: &RenderedNotification) -> Result<TransportOutcome, TransportError>;
}

/// In-memory transport used by tests and the all-in-one dev binary:
/// "delivers" everything it sees and records it for assertions, with an
/// optional injected failure mode for exercising retry/circuit-breaker
/// behavior without a real provider.
pub struct MockTransport {
    channel: notify_common::Channel,
    fail_next: std::sync::atomic::AtomicU32,
    sent: parking_lot::Mutex<Vec<RenderedNotification>>,
}

impl MockTransport {
    pub fn new(channel: notify_common::Channel) -> Self {
        Self {
            channel,
            fail_next: std::sync::atomic::AtomicU32::new(0),
            sent: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Make the next `n` sends fail transiently before succeeding again.
    pub fn fail_next_n(&self, n: u32) {
        self.fail_next.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<RenderedNotification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn channel(&self) -> notify_common::Channel {
        self.channel
    }

    async fn send(&self, notification: &RenderedNotification) -> Result<TransportOutcome, TransportError> {
        use std::sync::atomic::Ordering;

        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            return Ok(TransportOutcome::TransientFailure {
                error: "mock transient failure".to_string(),
            });
        }

        self.sent.lock().push(notification.clone());
        Ok(TransportOutcome::Delivered {
            provider_message_id: Some(uuid::Uuid::new_v4().to_string()),
        })
    }
}
