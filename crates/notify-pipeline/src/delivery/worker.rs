use notify_common::{Channel, RenderedNotification};
use tracing::info;

use super::circuit_breaker::CircuitBreaker;
use super::transport::{Transport, TransportOutcome};

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub max_retries: u32,
    pub circuit_breaker_failure_threshold: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            circuit_breaker_failure_threshold: 5,
        }
    }
}

/// What a delivery worker should do with the message it just attempted.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryDecision {
    /// Delivery succeeded — ack the underlying queue message.
    Ack,
    /// Retry after `delay_seconds` — nack with that delay.
    Retry { delay_seconds: u32 },
    /// Move straight to the dead-letter subject and ack.
    DeadLetter { reason: String },
}

/// Per-channel retry delays in milliseconds, indexed by `min(r - 1, len - 1)`
/// where `r` is the redelivery count of the attempt about to run. `in_app`
/// has no table: its retries are rare (store errors only) and unthrottled.
const RETRY_DELAYS_MS_EMAIL: [u32; 3] = [1_000, 5_000, 15_000];
const RETRY_DELAYS_MS_SMS: [u32; 3] = [2_000, 10_000, 30_000];
const RETRY_DELAYS_MS_PUSH: [u32; 3] = [1_000, 5_000, 15_000];

/// Delay before the attempt with this redelivery count, in whole seconds
/// (the queue's nack granularity). `r = 0` is the first attempt and is
/// never delayed.
fn retry_delay_seconds(channel: Channel, r: u32) -> u32 {
    if r == 0 {
        return 0;
    }
    let table: &[u32] = match channel {
        Channel::Email => &RETRY_DELAYS_MS_EMAIL,
        Channel::Sms => &RETRY_DELAYS_MS_SMS,
        Channel::Push => &RETRY_DELAYS_MS_PUSH,
        Channel::InApp => return 0,
    };
    let index = (r - 1) as usize;
    let delay_ms = table[index.min(table.len() - 1)];
    delay_ms / 1000
}

/// Circuit-breaker cooldown per channel: email/push cool down quickly,
/// sms a little longer since provider retries there are costlier.
fn circuit_breaker_cooldown(channel: Channel) -> std::time::Duration {
    match channel {
        Channel::Sms => std::time::Duration::from_secs(15),
        Channel::Email | Channel::Push | Channel::InApp => std::time::Duration::from_secs(10),
    }
}

pub struct DeliveryWorker<T: Transport> {
    transport: T,
    breaker: CircuitBreaker,
    config: DeliveryConfig,
}

impl<T: Transport> DeliveryWorker<T> {
    pub fn new(transport: T, config: DeliveryConfig) -> Self {
        let breaker = CircuitBreaker::new(
            config.circuit_breaker_failure_threshold,
            circuit_breaker_cooldown(transport.channel()),
        );
        Self {
            transport,
            breaker,
            config,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Attempt delivery of one rendered notification, returning the
    /// decision the caller's queue-driving loop should act on. Rate
    /// limiting is not this stage's concern — rule 4 is enforced earlier,
    /// in the preference filter.
    pub async fn attempt(&self, notification: &RenderedNotification, redelivery_count: u32) -> DeliveryDecision {
        if !self.breaker.allow_request() {
            return DeliveryDecision::Retry {
                delay_seconds: circuit_breaker_cooldown(self.transport.channel()).as_secs() as u32,
            };
        }

        let outcome = self.transport.send(notification).await;

        match outcome {
            Ok(TransportOutcome::Delivered { .. }) => {
                self.breaker.record_success();
                info!(event_id = %notification.event_id, channel = %notification.channel, "delivered");
                DeliveryDecision::Ack
            }
            Ok(TransportOutcome::PreconditionFailed { reason }) => {
                // Not a provider health problem, so the breaker doesn't trip.
                self.breaker.record_success();
                DeliveryDecision::DeadLetter { reason }
            }
            Ok(TransportOutcome::TransientFailure { error }) | Err(super::transport::TransportError::Failed(error)) => {
                self.breaker.record_failure();
                if redelivery_count + 1 >= self.config.max_retries {
                    DeliveryDecision::DeadLetter { reason: error }
                } else {
                    DeliveryDecision::Retry {
                        delay_seconds: retry_delay_seconds(notification.channel, redelivery_count + 1),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::transport::MockTransport;
    use notify_common::{Channel, EventType, Priority};

    fn notification() -> RenderedNotification {
        RenderedNotification {
            event_id: "e1".to_string(),
            event_type: EventType::Account,
            user_id: "u1".to_string(),
            channel: Channel::Email,
            priority: Priority::Normal,
            subject: None,
            body: "hello".to_string(),
            created_at: chrono::Utc::now(),
            rendered_at: chrono::Utc::now(),
            user_email: Some("u1@example.com".to_string()),
            user_phone: None,
            user_push_tokens: vec![],
        }
    }

    #[test]
    fn retry_delays_match_the_per_channel_table() {
        assert_eq!(retry_delay_seconds(Channel::Email, 0), 0);
        assert_eq!(retry_delay_seconds(Channel::Email, 1), 1);
        assert_eq!(retry_delay_seconds(Channel::Email, 2), 5);
        assert_eq!(retry_delay_seconds(Channel::Email, 3), 15);
        assert_eq!(retry_delay_seconds(Channel::Email, 4), 15);

        assert_eq!(retry_delay_seconds(Channel::Sms, 1), 2);
        assert_eq!(retry_delay_seconds(Channel::Sms, 2), 10);
        assert_eq!(retry_delay_seconds(Channel::Sms, 3), 30);

        assert_eq!(retry_delay_seconds(Channel::InApp, 1), 0);
        assert_eq!(retry_delay_seconds(Channel::InApp, 2), 0);
    }

    #[test]
    fn circuit_breaker_cooldown_is_per_channel() {
        assert_eq!(circuit_breaker_cooldown(Channel::Email).as_secs(), 10);
        assert_eq!(circuit_breaker_cooldown(Channel::Push).as_secs(), 10);
        assert_eq!(circuit_breaker_cooldown(Channel::Sms).as_secs(), 15);
    }

    #[tokio::test]
    async fn successful_send_acks() {
        let worker = DeliveryWorker::new(MockTransport::new(Channel::Email), DeliveryConfig::default());
        let decision = worker.attempt(&notification(), 0).await;
        assert_eq!(decision, DeliveryDecision::Ack);
    }

    #[tokio::test]
    async fn transient_failure_retries_with_backoff_until_max_retries() {
        let transport = MockTransport::new(Channel::Email);
        transport.fail_next_n(10);
        let config = DeliveryConfig {
            max_retries: 3,
            ..Default::default()
        };
        let worker = DeliveryWorker::new(transport, config);

        let first = worker.attempt(&notification(), 0).await;
        assert_eq!(first, DeliveryDecision::Retry { delay_seconds: 1 });

        let second = worker.attempt(&notification(), 1).await;
        assert_eq!(second, DeliveryDecision::Retry { delay_seconds: 5 });

        let third = worker.attempt(&notification(), 2).await;
        assert!(matches!(third, DeliveryDecision::DeadLetter { .. }));
    }

    #[tokio::test]
    async fn circuit_breaker_opens_after_repeated_failures_and_rejects_without_calling_transport() {
        let transport = MockTransport::new(Channel::Email);
        transport.fail_next_n(100);
        let config = DeliveryConfig {
            circuit_breaker_failure_threshold: 2,
            max_retries: 100,
            ..Default::default()
        };
        let worker = DeliveryWorker::new(transport, config);

        worker.attempt(&notification(), 0).await;
        worker.attempt(&notification(), 1).await;
        let sent_before = worker.transport().sent().len();

        let decision = worker.attempt(&notification(), 2).await;
        assert_eq!(decision, DeliveryDecision::Retry { delay_seconds: 10 });
        assert_eq!(worker.transport().sent().len(), sent_before);
    }
}
