//! Renderer worker.
//!
//! Polls the routed-event subject, looks up that channel's template for the
//! event type, substitutes placeholders, and forwards the rendered
//! notification to the delivery subject for its channel
//! (`notify.deliver.<channel>`).
//!
//! ## Environment variables
//!
//! Same `NOTIFY_*` variables as `ingestion-worker`; see that binary's doc
//! comment for the full table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use notify_common::Channel;
use notify_config::ConfigLoader;
use notify_pipeline::renderer;
use notify_queue::sqlite::SqliteQueue;
use notify_queue::{EmbeddedQueue, Message, QueueConsumer, QueuePublisher};
use notify_store::sqlite::SqliteStore;
use notify_store::NotifyStore;

#[derive(Parser, Debug)]
#[command(name = "renderer-worker")]
#[command(about = "Fills in per-channel templates for routed events")]
struct Args {
    #[arg(long, env = "NOTIFY_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "NOTIFY_POLL_INTERVAL_MS", default_value = "500")]
    poll_interval_ms: u64,

    #[arg(long, env = "NOTIFY_ROUTED_SUBJECT", default_value = "notify.events.routed")]
    routed_subject: String,

    #[arg(long, env = "NOTIFY_POLL_BATCH_SIZE", default_value = "10")]
    batch_size: u32,
}

fn delivery_subject(channel: Channel) -> String {
    format!("notify.deliver.{channel}")
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
    notify_common::logging::init_logging("renderer-worker");

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ConfigLoader::with_path(path.clone()).load()?,
        None => ConfigLoader::new().load()?,
    };

    info!("starting renderer worker");

    let store = build_store(&config.database.url).await?;
    let ack_wait_seconds = (config.broker.ack_wait_ms / 1000).max(1) as u32;
    let consumer = build_embedded_broker(&config.broker.url, &args.routed_subject, ack_wait_seconds).await?;

    let mut publishers = HashMap::new();
    for channel in Channel::ALL {
        let publisher =
            build_embedded_broker(&config.broker.url, &delivery_subject(channel), ack_wait_seconds).await?;
        publishers.insert(channel, publisher);
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let worker_handle = tokio::spawn(run_loop(
        consumer,
        publishers,
        store,
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

    info!("renderer worker shutdown complete");
    Ok(())
}

async fn run_loop(
    consumer: Arc<SqliteQueue>,
    publishers: HashMap<Channel, Arc<SqliteQueue>>,
    store: Arc<dyn NotifyStore>,
    poll_interval: Duration,
    batch_size: u32,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("renderer loop stopping");
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
            let routed = match serde_json::from_value::<notify_common::RoutedEvent>(queued.message.payload.clone()) {
                Ok(routed) => routed,
                Err(e) => {
                    warn!(error = %e, "dropping malformed routed event");
                    let _ = consumer.ack(&queued.receipt_handle).await;
                    continue;
                }
            };

            let channel = routed.channel;
            let template = match store.get_template(channel, routed.event_type).await {
                Ok(Some(template)) => template,
                Ok(None) => {
                    warn!(%channel, event_type = %routed.event_type, "no template configured, dropping");
                    let _ = consumer.ack(&queued.receipt_handle).await;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "template lookup failed, nacking for retry");
                    let _ = consumer.nack(&queued.receipt_handle, Some(5)).await;
                    continue;
                }
            };

            match renderer::render(routed, &template) {
                Ok(rendered) => {
                    let Some(publisher) = publishers.get(&channel) else {
                        error!(%channel, "no delivery publisher configured for channel");
                        let _ = consumer.nack(&queued.receipt_handle, Some(30)).await;
                        continue;
                    };

                    let payload = serde_json::to_value(&rendered).unwrap_or(serde_json::Value::Null);
                    match publisher.publish(Message::new(rendered.event_id.clone(), payload)).await {
                        Ok(_) => {
                            let _ = consumer.ack(&queued.receipt_handle).await;
                        }
                        Err(e) => {
                            error!(error = %e, "failed to forward rendered notification");
                            let _ = consumer.nack(&queued.receipt_handle, Some(5)).await;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "rendering failed, dropping (template mismatch is not retryable)");
                    let _ = consumer.ack(&queued.receipt_handle).await;
                }
            }
        }
    }
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "UP" }))
}

async fn metrics_handler() -> String {
    "# HELP notify_renderer_up Renderer worker is up\n# TYPE notify_renderer_up gauge\nnotify_renderer_up 1\n"
        .to_string()
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
