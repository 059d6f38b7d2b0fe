//! Development monolith.
//!
//! Runs every pipeline stage — ingestion, preference filtering,
//! rendering/routing, and one delivery worker per channel — in a single
//! process over one embedded, shared-memory SQLite database acting as both
//! the message broker and the relational store. Seeds a demo user,
//! template, and a handful of sample events, lets them flow end to end,
//! then prints an analytics summary. Intended for trying the system out
//! locally, not for production (see the `*-worker` binaries for that).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn};

use notify_cache::memory::InMemoryCache;
use notify_cache::NotificationCache;
use notify_common::{Channel, Delivery, DeliveryStatus, DlqEntry, EventType, RenderedNotification, SubmittedEvent};
use notify_config::ConfigLoader;
use notify_pipeline::delivery::transport::{Transport, TransportError, TransportOutcome};
use notify_pipeline::delivery::{DeliveryConfig, DeliveryDecision, DeliveryWorker};
use notify_pipeline::{analytics, ingestion, preferences, renderer};
use notify_queue::sqlite::SqliteQueue;
use notify_queue::{EmbeddedQueue, Message, QueueConsumer, QueuePublisher};
use notify_store::sqlite::SqliteStore;
use notify_store::NotifyStore;
use sqlx::sqlite::SqlitePoolOptions;

#[derive(Parser, Debug)]
#[command(name = "notify-dev")]
#[command(about = "Run the whole notification pipeline locally over an embedded SQLite database")]
struct Args {
    /// Number of sample events to seed.
    #[arg(long, default_value = "5")]
    events: u32,

    /// How long to let the pipeline drain before printing the summary, in seconds.
    #[arg(long, default_value = "3")]
    run_seconds: u64,
}

struct LoggingTransport {
    channel: Channel,
}

#[async_trait]
impl Transport for LoggingTransport {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, notification: &RenderedNotification) -> Result<TransportOutcome, TransportError> {
        info!(channel = %self.channel, to = %notification.user_id, body = %notification.body, "[dev] delivering");
        Ok(TransportOutcome::Delivered {
            provider_message_id: Some(uuid::Uuid::new_v4().to_string()),
        })
    }
}

fn delivery_subject(channel: Channel) -> String {
    format!("notify.deliver.{channel}")
}

async fn seed(store: &SqliteStore) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO users (id, email, phone, push_tokens) VALUES ('demo-user', 'demo@example.com', NULL, '[]')")
        .execute(store.pool())
        .await?;

    sqlx::query(
        "INSERT OR IGNORE INTO templates (channel, event_type, subject, body, variables) VALUES ('email', 'account', 'Welcome', 'Hi {{name}}, your account is ready.', '[\"name\"]')",
    )
    .execute(store.pool())
    .await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    notify_common::logging::init_logging("notify-dev");

    let args = Args::parse();
    let config = ConfigLoader::new().load()?;

    info!("starting notify-dev monolith");

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;

    let store = SqliteStore::new(pool.clone());
    store.init_schema().await?;
    seed(&store).await?;
    let store: Arc<dyn NotifyStore> = Arc::new(store);
    let cache: Arc<dyn NotificationCache> = Arc::new(InMemoryCache::new());

    let ack_wait_seconds = (config.broker.ack_wait_ms / 1000).max(1) as u32;
    let ingest_queue = Arc::new(SqliteQueue::new(pool.clone(), "notify.events.ingest".to_string(), ack_wait_seconds));
    let enriched_queue = Arc::new(SqliteQueue::new(pool.clone(), "notify.events.enriched".to_string(), ack_wait_seconds));
    let routed_queue = Arc::new(SqliteQueue::new(pool.clone(), "notify.events.routed".to_string(), ack_wait_seconds));
    let dlq_queue = Arc::new(SqliteQueue::new(pool.clone(), "notify.deliver.dlq".to_string(), ack_wait_seconds));
    for queue in [&ingest_queue, &enriched_queue, &routed_queue, &dlq_queue] {
        queue.init_schema().await?;
    }

    let mut delivery_queues = HashMap::new();
    for channel in Channel::ALL {
        let queue = Arc::new(SqliteQueue::new(pool.clone(), delivery_subject(channel), ack_wait_seconds));
        queue.init_schema().await?;
        delivery_queues.insert(channel, queue);
    }

    for i in 0..args.events {
        let event = SubmittedEvent {
            event_id: format!("dev-event-{i}"),
            event_type: EventType::Account,
            user_id: "demo-user".to_string(),
            channels: vec![Channel::Email],
            priority: notify_common::Priority::Normal,
            data: HashMap::from([("name".to_string(), serde_json::json!("Dev User"))]),
            scheduled_at: None,
            expires_at: None,
            metadata: None,
            created_at: chrono::Utc::now(),
        };
        let payload = serde_json::to_value(&event)?;
        ingest_queue.publish(Message::new(event.event_id.clone(), payload)).await?;
    }
    info!(count = args.events, "seeded sample events");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let mut handles = Vec::new();
    handles.push(tokio::spawn(ingest_loop(
        ingest_queue,
        enriched_queue.clone(),
        store.clone(),
        cache.clone(),
        config.dedup_ttl_seconds,
        shutdown_tx.subscribe(),
    )));
    handles.push(tokio::spawn(preference_loop(
        enriched_queue,
        routed_queue.clone(),
        store.clone(),
        cache.clone(),
        config.rate_limit_per_hour as u64,
        shutdown_tx.subscribe(),
    )));
    handles.push(tokio::spawn(renderer_loop(
        routed_queue,
        delivery_queues.clone(),
        store.clone(),
        shutdown_tx.subscribe(),
    )));
    for (channel, queue) in delivery_queues {
        let worker = Arc::new(DeliveryWorker::new(LoggingTransport { channel }, DeliveryConfig::default()));
        handles.push(tokio::spawn(delivery_loop(
            queue,
            dlq_queue.clone(),
            worker,
            store.clone(),
            cache.clone(),
            shutdown_tx.subscribe(),
        )));
    }

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let metrics_app = axum::Router::new().route("/health", axum::routing::get(|| async { "OK" }));
    if let Ok(listener) = tokio::net::TcpListener::bind(metrics_addr).await {
        info!(%metrics_addr, "health endpoint listening");
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(listener, metrics_app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        });
    }

    tokio::time::sleep(Duration::from_secs(args.run_seconds)).await;
    let _ = shutdown_tx.send(());
    for handle in handles {
        let _ = handle.await;
    }

    let summary = analytics::summarize_since(store.as_ref(), chrono::Utc::now() - chrono::Duration::minutes(5)).await?;
    info!(
        total = summary.total_deliveries,
        success_rate = summary.overall_success_rate,
        "final analytics summary"
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

async fn ingest_loop(
    consumer: Arc<SqliteQueue>,
    publisher: Arc<SqliteQueue>,
    store: Arc<dyn NotifyStore>,
    cache: Arc<dyn NotificationCache>,
    dedup_ttl_seconds: u64,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }

        let Ok(messages) = consumer.poll(10).await else { continue };
        for queued in messages {
            let Ok(event) = serde_json::from_value::<SubmittedEvent>(queued.message.payload.clone()) else {
                let _ = consumer.ack(&queued.receipt_handle).await;
                continue;
            };
            let event_id = event.event_id.clone();
            match ingestion::ingest(event, store.as_ref(), cache.as_ref(), dedup_ttl_seconds).await {
                Ok(ingestion::IngestOutcome::Enriched(enriched)) => {
                    let payload = serde_json::to_value(&enriched).unwrap_or(serde_json::Value::Null);
                    let _ = publisher.publish(Message::new(event_id, payload)).await;
                    let _ = consumer.ack(&queued.receipt_handle).await;
                }
                Ok(_) => {
                    let _ = consumer.ack(&queued.receipt_handle).await;
                }
                Err(e) => {
                    warn!(error = %e, "ingestion failed");
                    let _ = consumer.nack(&queued.receipt_handle, Some(5)).await;
                }
            }
        }
    }
}

async fn preference_loop(
    consumer: Arc<SqliteQueue>,
    publisher: Arc<SqliteQueue>,
    store: Arc<dyn NotifyStore>,
    cache: Arc<dyn NotificationCache>,
    rate_limit_per_hour: u64,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }

        let Ok(messages) = consumer.poll(10).await else { continue };
        for queued in messages {
            let Ok(enriched) = serde_json::from_value::<notify_common::EnrichedEvent>(queued.message.payload.clone())
            else {
                let _ = consumer.ack(&queued.receipt_handle).await;
                continue;
            };

            match preferences::route(&enriched, store.as_ref(), cache.as_ref(), rate_limit_per_hour).await {
                Ok(routed) => {
                    for route in routed {
                        let payload = serde_json::to_value(&route).unwrap_or(serde_json::Value::Null);
                        let _ = publisher
                            .publish(Message::new(format!("{}:{}", route.event_id, route.channel), payload))
                            .await;
                    }
                    let _ = consumer.ack(&queued.receipt_handle).await;
                }
                Err(e) => {
                    warn!(error = %e, "preference routing failed");
                    let _ = consumer.nack(&queued.receipt_handle, Some(5)).await;
                }
            }
        }
    }
}

async fn renderer_loop(
    consumer: Arc<SqliteQueue>,
    publishers: HashMap<Channel, Arc<SqliteQueue>>,
    store: Arc<dyn NotifyStore>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }

        let Ok(messages) = consumer.poll(10).await else { continue };
        for queued in messages {
            let Ok(routed) = serde_json::from_value::<notify_common::RoutedEvent>(queued.message.payload.clone())
            else {
                let _ = consumer.ack(&queued.receipt_handle).await;
                continue;
            };

            let channel = routed.channel;
            let template = match store.get_template(channel, routed.event_type).await {
                Ok(Some(t)) => t,
                Ok(None) => {
                    let _ = consumer.ack(&queued.receipt_handle).await;
                    continue;
                }
                Err(_) => {
                    let _ = consumer.nack(&queued.receipt_handle, Some(5)).await;
                    continue;
                }
            };

            match renderer::render(routed, &template) {
                Ok(rendered) => {
                    if let Some(publisher) = publishers.get(&channel) {
                        let payload = serde_json::to_value(&rendered).unwrap_or(serde_json::Value::Null);
                        let _ = publisher.publish(Message::new(rendered.event_id.clone(), payload)).await;
                    }
                    let _ = consumer.ack(&queued.receipt_handle).await;
                }
                Err(e) => {
                    warn!(error = %e, "rendering failed");
                    let _ = consumer.ack(&queued.receipt_handle).await;
                }
            }
        }
    }
}

async fn delivery_loop(
    consumer: Arc<SqliteQueue>,
    dlq_publisher: Arc<SqliteQueue>,
    worker: Arc<DeliveryWorker<LoggingTransport>>,
    store: Arc<dyn NotifyStore>,
    cache: Arc<dyn NotificationCache>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }

        let Ok(messages) = consumer.poll(10).await else { continue };
        for queued in messages {
            let Ok(notification) =
                serde_json::from_value::<RenderedNotification>(queued.message.payload.clone())
            else {
                let _ = consumer.ack(&queued.receipt_handle).await;
                continue;
            };

            let delivery_id = format!("{}:{}", notification.event_id, notification.channel);
            if queued.redelivery_count == 0 {
                let delivery = Delivery {
                    id: delivery_id.clone(),
                    user_id: notification.user_id.clone(),
                    channel: notification.channel,
                    event_type: notification.event_type,
                    event_id: notification.event_id.clone(),
                    status: DeliveryStatus::Pending,
                    attempt_count: 1,
                    metadata: delivery_metadata(&notification),
                    error: None,
                    created_at: notification.created_at,
                    updated_at: notification.created_at,
                    delivered_at: None,
                };
                let _ = store.record_delivery(&delivery).await;
            }

            let attempt_count = queued.redelivery_count as i32 + 1;
            let decision = worker.attempt(&notification, queued.redelivery_count).await;

            match decision {
                DeliveryDecision::Ack => {
                    let _ = store
                        .update_delivery_status(&delivery_id, DeliveryStatus::Delivered, attempt_count, None, Some(chrono::Utc::now()))
                        .await;
                    let _ = consumer.ack(&queued.receipt_handle).await;

                    if notification.channel == Channel::InApp {
                        broadcast_in_app(cache.as_ref(), &delivery_id, &notification).await;
                    }
                }
                DeliveryDecision::Retry { delay_seconds } => {
                    let _ = consumer.nack(&queued.receipt_handle, Some(delay_seconds)).await;
                }
                DeliveryDecision::DeadLetter { reason } => {
                    let _ = store
                        .update_delivery_status(&delivery_id, DeliveryStatus::Failed, attempt_count, Some(reason.clone()), None)
                        .await;
                    let entry = DlqEntry {
                        notification: notification.clone(),
                        error: reason,
                        moved_to_dlq_at: chrono::Utc::now(),
                    };
                    let payload = serde_json::to_value(&entry).unwrap_or(serde_json::Value::Null);
                    let _ = dlq_publisher.publish(Message::new(delivery_id.clone(), payload)).await;
                    let _ = consumer.ack(&queued.receipt_handle).await;
                }
            }
        }
    }
}

fn delivery_metadata(notification: &RenderedNotification) -> serde_json::Value {
    let recipient = match notification.channel {
        Channel::Email => notification.user_email.clone(),
        Channel::Sms => notification.user_phone.clone(),
        Channel::Push => Some(format!("{} device(s)", notification.user_push_tokens.len())),
        Channel::InApp => Some(notification.user_id.clone()),
    };

    serde_json::json!({
        "recipient": recipient,
        "transport": notification.channel.as_str(),
        "subject": notification.subject,
        "device_count": notification.user_push_tokens.len(),
    })
}

async fn broadcast_in_app(cache: &dyn NotificationCache, delivery_id: &str, notification: &RenderedNotification) {
    let payload = serde_json::json!({
        "user_id": notification.user_id,
        "notification": {
            "id": delivery_id,
            "event_id": notification.event_id,
            "event_type": notification.event_type,
            "subject": notification.subject,
            "body": notification.body,
            "priority": notification.priority,
            "created_at": notification.created_at,
        }
    });

    if let Ok(payload) = serde_json::to_string(&payload) {
        let _ = cache.publish_notification("ws:notifications", &payload).await;
    }
}
