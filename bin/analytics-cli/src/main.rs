//! One-shot CLI over the delivery audit log: success rates, per-channel
//! metrics, and top event types for a trailing window. Read-only — this
//! binary never writes to the store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use notify_config::ConfigLoader;
use notify_pipeline::analytics;
use notify_store::sqlite::SqliteStore;
use notify_store::NotifyStore;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "analytics-cli")]
#[command(about = "Summarize delivery outcomes over a trailing window")]
struct Args {
    #[arg(long, env = "NOTIFY_CONFIG")]
    config: Option<PathBuf>,

    /// How far back to look, in hours.
    #[arg(long, default_value = "24")]
    since_hours: i64,

    /// Emit the summary as JSON instead of a human-readable table.
    #[arg(long)]
    json: bool,
}

async fn build_store(database_url: &str) -> Result<Arc<dyn NotifyStore>> {
    if database_url.starts_with("postgres") {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
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

#[tokio::main]
async fn main() -> Result<()> {
    notify_common::logging::init_logging("analytics-cli");

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ConfigLoader::with_path(path.clone()).load()?,
        None => ConfigLoader::new().load()?,
    };

    let store = build_store(&config.database.url).await?;
    let since = Utc::now() - ChronoDuration::hours(args.since_hours);

    info!(since_hours = args.since_hours, "summarizing deliveries");
    let summary = analytics::summarize_since(store.as_ref(), since).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "Deliveries since {} ({} total, {:.1}% overall success)",
            summary.period_start.to_rfc3339(),
            summary.total_deliveries,
            summary.overall_success_rate * 100.0
        );
        println!();
        println!("{:<10} {:>10} {:>10} {:>10} {:>10}", "channel", "attempted", "delivered", "failed", "success%");
        let mut channels: Vec<_> = summary.by_channel.iter().collect();
        channels.sort_by_key(|(channel, _)| channel.as_str());
        for (channel, metrics) in channels {
            println!(
                "{:<10} {:>10} {:>10} {:>10} {:>9.1}%",
                channel.as_str(),
                metrics.attempted,
                metrics.delivered,
                metrics.failed,
                metrics.success_rate * 100.0
            );
        }

        println!();
        println!("Top event types:");
        for (event_type, count) in &summary.top_event_types {
            println!("  {:<12} {}", event_type.as_str(), count);
        }
    }

    Ok(())
}
