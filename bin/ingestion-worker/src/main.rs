//! Ingestion worker.
//!
//! Polls the raw event ingress subject, validates and deduplicates each
//! event, resolves recipient contact data, and forwards the enriched event
//! to the preference subject for the next stage to pick up.
//!
//! ## Environment variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `NOTIFY_CONFIG` | - | Path to a TOML config file |
//! | `NOTIFY_BROKER_URL` | `sqlite::memory:` | `nats://` URL or a SQLite path/`:memory:` |
//! | `NOTIFY_DATABASE_URL` | `sqlite::memory:` | `postgres://` URL or a SQLite path |
//! | `NOTIFY_REDIS_URL` | `redis://127.0.0.1:6379` | `memory` for the in-process test double |
//! | `NOTIFY_DEDUP_TTL_SECONDS` | `3600` | Idempotency window |
//! | `NOTIFY_METRICS_PORT` | `9090` | Metrics/health port |
//! | `RUST_LOG` | `info` | Log level |

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
use notify_pipeline::ingestion::{self, IngestOutcome};
use notify_queue::sqlite::SqliteQueue;
use notify_queue::{EmbeddedQueue, Message, QueueConsumer, QueuePublisher};
use notify_store::sqlite::SqliteStore;
use notify_store::NotifyStore;

#[derive(Parser, Debug)]
#[command(name = "ingestion-worker")]
#[command(about = "Validates, deduplicates, and enriches incoming notification events")]
struct Args {
    #[arg(long, env = "NOTIFY_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "NOTIFY_POLL_INTERVAL_MS", default_value = "500")]
    poll_interval_ms: u64,

    #[arg(long, env = "NOTIFY_INGEST_SUBJECT", default_value = "notify.events.ingest")]
    ingest_subject: String,

    #[arg(long, env = "NOTIFY_ENRICHED_SUBJECT", default_value = "notify.events.enriched")]
    enriched_subject: String,

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
        info!("connected to PostgreSQL store");
        Ok(Arc::new(store))
    } else {
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let store = SqliteStore::new(pool);
        store.init_schema().await?;
        info!(url = %database_url, "connected to SQLite store");
        Ok(Arc::new(store))
    }
}

async fn build_cache(redis_url: &str) -> Result<Arc<dyn NotificationCache>> {
    if redis_url.eq_ignore_ascii_case("memory") {
        info!("using in-process cache (no Redis configured)");
        Ok(Arc::new(InMemoryCache::new()))
    } else {
        let cache = RedisCache::connect(redis_url).await?;
        info!("connected to Redis cache");
        Ok(Arc::new(cache))
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
    notify_common::logging::init_logging("ingestion-worker");

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ConfigLoader::with_path(path.clone()).load()?,
        None => ConfigLoader::new().load()?,
    };

    info!("starting ingestion worker");

    let store = build_store(&config.database.url).await?;
    let cache = build_cache(&config.cache.url).await?;

    let ack_wait_seconds = (config.broker.ack_wait_ms / 1000).max(1) as u32;
    let consumer = build_embedded_broker(&config.broker.url, &args.ingest_subject, ack_wait_seconds).await?;
    let publisher: Arc<SqliteQueue> =
        build_embedded_broker(&config.broker.url, &args.enriched_subject, ack_wait_seconds).await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut shutdown_rx = shutdown_tx.subscribe();

    let worker_handle = tokio::spawn(run_loop(
        consumer,
        publisher,
        store,
        cache,
        Duration::from_millis(args.poll_interval_ms),
        args.batch_size,
        config.dedup_ttl_seconds,
        shutdown_tx.subscribe(),
    ));

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let metrics_app = axum::Router::new()
        .route("/health", axum::routing::get(health_handler))
        .route("/ready", axum::routing::get(health_handler))
        .route("/metrics", axum::routing::get(metrics_handler));
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!(%metrics_addr, "metrics server listening");
    let metrics_handle = tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
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

    info!("ingestion worker shutdown complete");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    consumer: Arc<SqliteQueue>,
    publisher: Arc<SqliteQueue>,
    store: Arc<dyn NotifyStore>,
    cache: Arc<dyn NotificationCache>,
    poll_interval: Duration,
    batch_size: u32,
    dedup_ttl_seconds: u64,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("ingestion loop stopping");
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
            let event = match serde_json::from_value::<notify_common::SubmittedEvent>(queued.message.payload.clone()) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "dropping malformed event");
                    let _ = consumer.ack(&queued.receipt_handle).await;
                    continue;
                }
            };

            let event_id = event.event_id.clone();
            match ingestion::ingest(event, store.as_ref(), cache.as_ref(), dedup_ttl_seconds).await {
                Ok(IngestOutcome::Enriched(enriched)) => {
                    let payload = serde_json::to_value(&enriched).unwrap_or(serde_json::Value::Null);
                    let publish_result = publisher.publish(Message::new(event_id, payload)).await;
                    match publish_result {
                        Ok(_) => {
                            let _ = consumer.ack(&queued.receipt_handle).await;
                        }
                        Err(e) => {
                            error!(error = %e, "failed to forward enriched event, will retry");
                            let _ = consumer.nack(&queued.receipt_handle, Some(5)).await;
                        }
                    }
                }
                Ok(IngestOutcome::Duplicate) | Ok(IngestOutcome::Expired) => {
                    let _ = consumer.ack(&queued.receipt_handle).await;
                }
                Err(e) => {
                    warn!(error = %e, "ingestion failed, nacking for retry");
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
    "# HELP notify_ingestion_up Ingestion worker is up\n# TYPE notify_ingestion_up gauge\nnotify_ingestion_up 1\n"
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
