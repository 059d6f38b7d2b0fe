use async_trait::async_trait;
use async_nats::jetstream::{self, consumer::PullConsumer, Context, Message as JsMessage};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::{Message, QueueConsumer, QueueError, QueueMetrics, QueuePublisher, QueuedMessage, Result};

/// Durable pull-consumer over a JetStream stream, for production deployments.
/// The stream (subjects, 24h max age, work-queue retention) is provisioned
/// once at startup via [`ensure_stream`]; this type holds the durable
/// consumer handle plus a short-lived map from receipt handle to the
/// in-flight JetStream message, since acks are per-message and the trait
/// boundary addresses messages by handle rather than by owned value.
pub struct NatsQueue {
    consumer: PullConsumer,
    subject: String,
    running: AtomicBool,
    in_flight: Mutex<HashMap<String, JsMessage>>,
}

impl NatsQueue {
    pub async fn connect(
        url: &str,
        stream_name: &str,
        subject: &str,
        durable_name: &str,
        ack_wait: Duration,
        max_deliver: i64,
    ) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| QueueError::Nats(e.to_string()))?;
        let jetstream = jetstream::new(client);

        let stream = ensure_stream(&jetstream, stream_name, subject).await?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                durable_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(durable_name.to_string()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait,
                    max_deliver,
                    filter_subject: subject.to_string(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::Nats(e.to_string()))?;

        Ok(Self {
            consumer,
            subject: subject.to_string(),
            running: AtomicBool::new(true),
            in_flight: Mutex::new(HashMap::new()),
        })
    }
}

/// Create the stream if it doesn't already exist, scoped to one subject
/// with a 24h max age so undelivered notifications eventually expire
/// rather than retrying forever.
pub async fn ensure_stream(
    jetstream: &Context,
    stream_name: &str,
    subject: &str,
) -> Result<jetstream::stream::Stream> {
    jetstream
        .get_or_create_stream(jetstream::stream::Config {
            name: stream_name.to_string(),
            subjects: vec![subject.to_string()],
            max_age: Duration::from_secs(24 * 60 * 60),
            retention: jetstream::stream::RetentionPolicy::WorkQueue,
            ..Default::default()
        })
        .await
        .map_err(|e| QueueError::Nats(e.to_string()))
}

#[async_trait]
impl QueueConsumer for NatsQueue {
    fn identifier(&self) -> &str {
        &self.subject
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<QueuedMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let mut batch = self
            .consumer
            .fetch()
            .max_messages(max_messages as usize)
            .expires(Duration::from_secs(2))
            .messages()
            .await
            .map_err(|e| QueueError::Nats(e.to_string()))?;

        let mut messages = Vec::new();
        while let Some(next) = batch.next().await {
            let msg = match next {
                Ok(msg) => msg,
                Err(e) => {
                    error!(error = %e, "failed to fetch JetStream message");
                    continue;
                }
            };

            let info = match msg.info() {
                Ok(info) => info,
                Err(e) => {
                    error!(error = %e, "missing JetStream message metadata");
                    continue;
                }
            };
            let redelivery_count = info.delivered.saturating_sub(1) as u32;
            let stream_sequence = info.stream_sequence;
            let consumer_sequence = info.consumer_sequence;

            let value: serde_json::Value = match serde_json::from_slice(&msg.payload) {
                Ok(v) => v,
                Err(e) => {
                    error!(error = %e, "malformed JetStream payload, acking to drop");
                    let _ = msg.ack().await;
                    continue;
                }
            };

            let broker_message_id = msg
                .headers
                .as_ref()
                .and_then(|h| h.get("Nats-Msg-Id"))
                .map(|v| v.to_string());

            let receipt_handle = format!("{stream_sequence}:{consumer_sequence}");

            messages.push(QueuedMessage {
                message: Message::new(
                    broker_message_id.clone().unwrap_or_else(|| receipt_handle.clone()),
                    value,
                ),
                receipt_handle: receipt_handle.clone(),
                broker_message_id,
                queue_identifier: self.subject.clone(),
                redelivery_count,
            });

            self.in_flight.lock().insert(receipt_handle, msg);
        }

        if !messages.is_empty() {
            debug!(subject = %self.subject, count = messages.len(), "pulled messages from JetStream");
        }

        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let msg = self
            .in_flight
            .lock()
            .remove(receipt_handle)
            .ok_or_else(|| QueueError::NotFound(receipt_handle.to_string()))?;

        msg.ack().await.map_err(|e| QueueError::Nats(e.to_string()))
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        let msg = self
            .in_flight
            .lock()
            .remove(receipt_handle)
            .ok_or_else(|| QueueError::NotFound(receipt_handle.to_string()))?;

        let ack_kind = match delay_seconds {
            Some(secs) if secs > 0 => jetstream::AckKind::Nak(Some(Duration::from_secs(secs as u64))),
            _ => jetstream::AckKind::Nak(None),
        };

        msg.ack_with(ack_kind)
            .await
            .map_err(|e| QueueError::Nats(e.to_string()))
    }

    async fn extend_visibility(&self, receipt_handle: &str, _seconds: u32) -> Result<()> {
        let in_flight = self.in_flight.lock();
        let msg = in_flight
            .get(receipt_handle)
            .ok_or_else(|| QueueError::NotFound(receipt_handle.to_string()))?;
        let msg = msg.clone();
        drop(in_flight);

        msg.ack_with(jetstream::AckKind::Progress)
            .await
            .map_err(|e| QueueError::Nats(e.to_string()))
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(subject = %self.subject, "JetStream consumer stopped");
    }

    async fn get_metrics(&self) -> Result<Option<QueueMetrics>> {
        let info = self
            .consumer
            .info()
            .await
            .map_err(|e| QueueError::Nats(e.to_string()))?;

        Ok(Some(QueueMetrics {
            pending_messages: info.num_pending,
            in_flight_messages: info.num_ack_pending as u64,
            queue_identifier: self.subject.clone(),
        }))
    }
}

pub struct NatsPublisher {
    jetstream: Context,
    subject: String,
}

impl NatsPublisher {
    pub fn new(jetstream: Context, subject: String) -> Self {
        Self { jetstream, subject }
    }
}

#[async_trait]
impl QueuePublisher for NatsPublisher {
    fn identifier(&self) -> &str {
        &self.subject
    }

    async fn publish(&self, message: Message) -> Result<String> {
        let payload = serde_json::to_vec(&message.payload)?;
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", message.id.as_str());

        self.jetstream
            .publish_with_headers(self.subject.clone(), headers, payload.into())
            .await
            .map_err(|e| QueueError::Nats(e.to_string()))?
            .await
            .map_err(|e| QueueError::Nats(e.to_string()))?;

        Ok(message.id)
    }

    async fn publish_batch(&self, messages: Vec<Message>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            ids.push(self.publish(message).await?);
        }
        Ok(ids)
    }
}
