//! Preference worker.
//!
//! Polls the enriched-event subject and narrows each event down to the
//! channels its recipient actually allows (explicit disables, quiet hours,
//! marketing default-deny), publishing one routed message per allowed
//! channel onto the routed subject for the renderer stage.
//!
//! ## Environment variables
//!
//! Same `NOTIFY_*` variables as `ingestion-worker`; see that binary's doc
//! comment for the full table.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use notify_cache::memory::InMemoryCache;
use notify_cache::redis_cache::RedisCache;
use notify_cache::NotificationCache;
use notify_config::ConfigLoader;
use notify_pipeline::preferences;
use notify_queue::sqlite::SqliteQueue;
use notify_queue::{EmbeddedQueue, Message, QueueConsumer, QueuePublisher};
use notify_store::sqlite::SqliteStore;
use notify_store::NotifyStore;

#[derive(Parser, Debug)]
#[command(name = "preference-worker")]
#[command(about = "Filters enriched events down to their recipient's allowed channels")]
struct Args {
    #[arg(long, env = "NOTIFY_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "NOTIFY_POLL_INTERVAL_MS", default_value = "500")]
    poll_interval_ms: u64,

    #[arg(long, env = "NOTIFY_ENRICHED_SUBJECT", default_value = "notify.events.enriched")]
    enriched_subject: String,

    #[arg(long, env = "NOTIFY_ROUTED_SUBJECT", default_value = "notify.events.routed")]
    routed_subject: String,

    #[arg(long, env = "NOTIFY_POLL_BATCH_SIZE", default_value = "10")]
    batch_size: u32,
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
    notify_common::logging::init_logging("preference-worker");

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ConfigLoader::with_path(path.clone()).load()?,
        None => ConfigLoader::new().load()?,
    };

    info!("starting preference worker");

    let store = build_store(&config.database.url).await?;
    let cache = build_cache(&config.cache.url).await?;
    let ack_wait_seconds = (config.broker.ack_wait_ms / 1000).max(1) as u32;
    let consumer = build_embedded_broker(&config.broker.url, &args.enriched_subject, ack_wait_seconds).await?;
    let publisher = build_embedded_broker(&config.broker.url, &args.routed_subject, ack_wait_seconds).await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let worker_handle = tokio::spawn(run_loop(
        consumer,
        publisher,
        store,
        cache,
        config.rate_limit_per_hour as u64,
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

    info!("preference worker shutdown complete");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    consumer: Arc<SqliteQueue>,
    publisher: Arc<SqliteQueue>,
    store: Arc<dyn NotifyStore>,
    cache: Arc<dyn NotificationCache>,
    rate_limit_per_hour: u64,
    poll_interval: Duration,
    batch_size: u32,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("preference loop stopping");
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
            let enriched =
                match serde_json::from_value::<notify_common::EnrichedEvent>(queued.message.payload.clone()) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "dropping malformed enriched event");
                        let _ = consumer.ack(&queued.receipt_handle).await;
                        continue;
                    }
                };

            match preferences::route(&enriched, store.as_ref(), cache.as_ref(), rate_limit_per_hour).await {
                Ok(routed) => {
                    let mut publish_failed = false;
                    for route in routed {
                        let payload = serde_json::to_value(&route).unwrap_or(serde_json::Value::Null);
                        if let Err(e) = publisher
                            .publish(Message::new(format!("{}:{}", route.event_id, route.channel), payload))
                            .await
                        {
                            error!(error = %e, "failed to forward routed event");
                            publish_failed = true;
                        }
                    }

                    if publish_failed {
                        let _ = consumer.nack(&queued.receipt_handle, Some(5)).await;
                    } else {
                        let _ = consumer.ack(&queued.receipt_handle).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "preference routing failed, nacking for retry");
                    let _ = consumer.nack(&queued.receipt_handle, Some(5)).await;
                }
            }
        }
    }
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "UP" }))
}

async fn metrics_handler() -> String {
    "# HELP notify_preference_up Preference worker is up\n# TYPE notify_preference_up gauge\nnotify_preference_up 1\n"
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
