//! Delivery worker.
//!
//! Polls one channel's delivery subject (`notify.deliver.<channel>`) and
//! hands each rendered notification to that channel's transport, applying
//! circuit breaking and retry/dead-letter decisions. Real provider SDKs
//! (SES, Twilio, FCM/APNs) are out of scope; this binary logs what it would
//! send through [`LoggingTransport`], the seam a deployment wires a real
//! implementation into. The `in_app` channel additionally broadcasts each
//! delivered notification onto the ephemeral `ws:notifications` pub/sub
//! channel for a (out-of-scope) real-time fan-out layer to observe.
//!
//! ## Environment variables
//!
//! Same `NOTIFY_*` variables as `ingestion-worker`, plus:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `NOTIFY_CHANNEL` | - | Required: `email`, `sms`, `push`, or `in_app` |
//! | `NOTIFY_MAX_RETRIES` | `3` | In-process retries before dead-lettering |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use notify_cache::memory::InMemoryCache;
use notify_cache::redis_cache::RedisCache;
use notify_cache::NotificationCache;
use notify_common::{Channel, Delivery, DeliveryStatus, DlqEntry, RenderedNotification};
use notify_config::ConfigLoader;
use notify_pipeline::delivery::transport::{Transport, TransportError, TransportOutcome};
use notify_pipeline::delivery::{DeliveryConfig, DeliveryDecision, DeliveryWorker};
use notify_queue::sqlite::SqliteQueue;
use notify_queue::{EmbeddedQueue, Message, QueueConsumer, QueuePublisher};
use notify_store::sqlite::SqliteStore;
use notify_store::NotifyStore;

#[derive(Parser, Debug)]
#[command(name = "delivery-worker")]
#[command(about = "Delivers rendered notifications for one channel")]
struct Args {
    #[arg(long, env = "NOTIFY_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "NOTIFY_CHANNEL")]
    channel: String,

    #[arg(long, env = "NOTIFY_POLL_INTERVAL_MS", default_value = "500")]
    poll_interval_ms: u64,

    #[arg(long, env = "NOTIFY_POLL_BATCH_SIZE", default_value = "10")]
    batch_size: u32,

    #[arg(long, env = "NOTIFY_DLQ_SUBJECT", default_value = "notify.deliver.dlq")]
    dlq_subject: String,
}

/// Stand-in for a real provider SDK: logs the notification it would send
/// and always reports delivery. The seam a deployment wires a real
/// transport into (SES, Twilio, FCM/APNs).
struct LoggingTransport {
    channel: Channel,
}

#[async_trait]
impl Transport for LoggingTransport {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, notification: &RenderedNotification) -> Result<TransportOutcome, TransportError> {
        info!(
            event_id = %notification.event_id,
            user_id = %notification.user_id,
            channel = %notification.channel,
            subject = ?notification.subject,
            "delivering notification"
        );
        Ok(TransportOutcome::Delivered {
            provider_message_id: Some(uuid::Uuid::new_v4().to_string()),
        })
    }
}

async fn build_store(database_url: &str) -> Result<Arc<dyn NotifyStore>> {
    if database_url.starts_with("postgres") {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        let store = notify_store::postgres::PostgresStore::new(pool);
        store.init_schema().await?;
        Ok(Arc::new(store))
    } else {
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let store = SqliteStore::new(pool);
        store.init_schema().await?;
        Ok(Arc::new(store))
    }
}

async fn build_cache(redis_url: &str) -> Result<Arc<dyn NotificationCache>> {
    if redis_url.eq_ignore_ascii_case("memory") {
        Ok(Arc::new(InMemoryCache::new()))
    } else {
        Ok(Arc::new(RedisCache::connect(redis_url).await?))
    }
}

async fn build_embedded_broker(broker_url: &str, subject: &str, ack_wait_seconds: u32) -> Result<Arc<SqliteQueue>> {
    let max_connections = if broker_url.contains(":memory:") { 1 } else { 5 };
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(broker_url)
        .await?;
    let queue = SqliteQueue::new(pool, subject.to_string(), ack_wait_seconds);
    queue.init_schema().await?;
    Ok(Arc::new(queue))
}

#[tokio::main]
async fn main() -> Result<()> {
    notify_common::logging::init_logging("delivery-worker");

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ConfigLoader::with_path(path.clone()).load()?,
        None => ConfigLoader::new().load()?,
    };

    let channel = Channel::parse(&args.channel)
        .with_context(|| format!("unknown channel '{}': use email, sms, push, or in_app", args.channel))?;

    info!(%channel, "starting delivery worker");

    let store = build_store(&config.database.url).await?;
    let cache = build_cache(&config.cache.url).await?;

    let ack_wait_seconds = (config.broker.ack_wait_ms / 1000).max(1) as u32;
    let subject = format!("notify.deliver.{channel}");
    let consumer = build_embedded_broker(&config.broker.url, &subject, ack_wait_seconds).await?;
    let dlq_publisher = build_embedded_broker(&config.broker.url, &args.dlq_subject, ack_wait_seconds).await?;

    let delivery_config = DeliveryConfig {
        max_retries: config.max_retries,
        ..Default::default()
    };
    let worker = Arc::new(DeliveryWorker::new(LoggingTransport { channel }, delivery_config));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let worker_handle = tokio::spawn(run_loop(
        consumer,
        dlq_publisher,
        worker,
        store,
        cache,
        Duration::from_millis(args.poll_interval_ms),
        args.batch_size,
        shutdown_tx.subscribe(),
    ));

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let metrics_app = axum::Router::new()
        .route("/health", axum::routing::get(health_handler))
        .route("/ready", axum::routing::get(health_handler))
        .route("/metrics", axum::routing::get(metrics_handler));
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!(%metrics_addr, "metrics server listening");
    let mut shutdown_rx_metrics = shutdown_tx.subscribe();
    let metrics_handle = tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx_metrics.recv().await;
            })
            .await
            .ok();
    });

    shutdown_signal().await;
    info!("shutdown signal received, draining in-flight work");
    let _ = shutdown_tx.send(());

    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = worker_handle.await;
        let _ = metrics_handle.await;
    })
    .await;

    info!("delivery worker shutdown complete");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    consumer: Arc<SqliteQueue>,
    dlq_publisher: Arc<SqliteQueue>,
    worker: Arc<DeliveryWorker<LoggingTransport>>,
    store: Arc<dyn NotifyStore>,
    cache: Arc<dyn NotificationCache>,
    poll_interval: Duration,
    batch_size: u32,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("delivery loop stopping");
                return;
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }

        let messages = match consumer.poll(batch_size).await {
            Ok(messages) => messages,
            Err(e) => {
                error!(error = %e, "poll failed");
                continue;
            }
        };

        for queued in messages {
            let notification =
                match serde_json::from_value::<RenderedNotification>(queued.message.payload.clone()) {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "dropping malformed rendered notification");
                        let _ = consumer.ack(&queued.receipt_handle).await;
                        continue;
                    }
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
                if let Err(e) = store.record_delivery(&delivery).await {
                    error!(error = %e, "failed to record delivery audit row");
                }
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
                    if let Err(e) = dlq_publisher.publish(Message::new(delivery_id.clone(), payload)).await {
                        error!(error = %e, "failed to publish to dead-letter subject");
                    }
                    let _ = consumer.ack(&queued.receipt_handle).await;
                }
            }
        }
    }
}

/// Channel-specific audit metadata: recipient, the transport that handled
/// it, and (for push) how many devices it fanned out to. Set once, at
/// insert time, since none of it changes across redeliveries of the same
/// delivery row.
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

/// In-app worker's extra step: after the delivery row is durable, publish a
/// compact JSON notification onto the ephemeral broadcast channel so an
/// external real-time fan-out layer can observe it. Best-effort — a failure
/// here does not affect the already-recorded delivery outcome.
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
        if let Err(e) = cache.publish_notification("ws:notifications", &payload).await {
            warn!(error = %e, "failed to broadcast in-app notification");
        }
    }
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "UP" }))
}

async fn metrics_handler() -> String {
    "# HELP notify_delivery_up Delivery worker is up\n# TYPE notify_delivery_up gauge\nnotify_delivery_up 1\n".to_string()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
