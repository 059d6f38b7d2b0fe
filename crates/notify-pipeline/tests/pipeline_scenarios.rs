//! End-to-end scenarios running all five pipeline stages against a real
//! (in-memory) store, cache, and mock transport — no queue broker involved,
//! since the stage functions themselves are broker-agnostic.

use chrono::Utc;
use notify_cache::memory::InMemoryCache;
use notify_common::{Channel, EventType, Priority, SubmittedEvent};
use notify_pipeline::delivery::{DeliveryConfig, DeliveryDecision, DeliveryWorker, Transport};
use notify_pipeline::delivery::transport::MockTransport;
use notify_pipeline::{analytics, ingestion, preferences, renderer};
use notify_store::sqlite::SqliteStore;
use notify_store::NotifyStore;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::HashMap;

async fn test_store() -> SqliteStore {
    let pool = SqlitePoolOptions::new()
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteStore::new(pool);
    store.init_schema().await.unwrap();
    store
}

async fn seed_user(store: &SqliteStore, id: &str, email: &str) {
    sqlx::query("INSERT INTO users (id, email, phone, push_tokens) VALUES (?, ?, NULL, '[]')")
        .bind(id)
        .bind(email)
        .execute(store.pool())
        .await
        .unwrap();
}

async fn seed_template(store: &SqliteStore, channel: Channel, event_type: EventType, body: &str) {
    sqlx::query("INSERT INTO templates (channel, event_type, subject, body, variables) VALUES (?, ?, ?, ?, '[]')")
        .bind(channel.as_str())
        .bind(event_type.as_str())
        .bind(Some("Hi {{name}}"))
        .bind(body)
        .execute(store.pool())
        .await
        .unwrap();
}

fn submitted_event(event_id: &str, event_type: EventType, channels: Vec<Channel>) -> SubmittedEvent {
    let mut data = HashMap::new();
    data.insert("name".to_string(), serde_json::json!("Priya"));

    SubmittedEvent {
        event_id: event_id.to_string(),
        event_type,
        user_id: "u-1".to_string(),
        channels,
        priority: Priority::Normal,
        data,
        scheduled_at: None,
        expires_at: None,
        metadata: None,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn event_flows_through_every_stage_to_a_delivered_notification() {
    let store = test_store().await;
    let cache = InMemoryCache::new();
    seed_user(&store, "u-1", "priya@example.com").await;
    seed_template(&store, Channel::Email, EventType::Account, "Hi {{name}}, welcome!").await;

    let event = submitted_event("evt-1", EventType::Account, vec![Channel::Email]);

    let enriched = match ingestion::ingest(event, &store, &cache, 3600).await.unwrap() {
        ingestion::IngestOutcome::Enriched(e) => e,
        other => panic!("expected Enriched, got {other:?}"),
    };
    assert_eq!(enriched.user_email.as_deref(), Some("priya@example.com"));

    let routed = preferences::route(&enriched, &store, &cache, preferences::DEFAULT_RATE_LIMIT)
        .await
        .unwrap();
    assert_eq!(routed.len(), 1);

    let template = store
        .get_template(Channel::Email, EventType::Account)
        .await
        .unwrap()
        .unwrap();
    let rendered = renderer::render(routed.into_iter().next().unwrap(), &template).unwrap();
    assert_eq!(rendered.body, "Hi Priya, welcome!");

    let worker = DeliveryWorker::new(MockTransport::new(Channel::Email), DeliveryConfig::default());
    let decision = worker.attempt(&rendered, 0).await;
    assert_eq!(decision, DeliveryDecision::Ack);
    assert_eq!(worker.transport().sent().len(), 1);
}

#[tokio::test]
async fn duplicate_event_id_is_rejected_on_second_ingest() {
    let store = test_store().await;
    let cache = InMemoryCache::new();
    seed_user(&store, "u-1", "priya@example.com").await;

    let first = ingestion::ingest(
        submitted_event("evt-dup", EventType::Account, vec![Channel::Email]),
        &store,
        &cache,
        3600,
    )
    .await
    .unwrap();
    assert!(matches!(first, ingestion::IngestOutcome::Enriched(_)));

    let second = ingestion::ingest(
        submitted_event("evt-dup", EventType::Account, vec![Channel::Email]),
        &store,
        &cache,
        3600,
    )
    .await
    .unwrap();
    assert!(matches!(second, ingestion::IngestOutcome::Duplicate));
}

#[tokio::test]
async fn marketing_event_with_no_preference_row_never_reaches_delivery() {
    let store = test_store().await;
    let cache = InMemoryCache::new();
    seed_user(&store, "u-1", "priya@example.com").await;

    let event = submitted_event("evt-mkt", EventType::Marketing, vec![Channel::Email, Channel::Sms]);
    let enriched = match ingestion::ingest(event, &store, &cache, 3600).await.unwrap() {
        ingestion::IngestOutcome::Enriched(e) => e,
        other => panic!("expected Enriched, got {other:?}"),
    };

    let routed = preferences::route(&enriched, &store, &cache, preferences::DEFAULT_RATE_LIMIT)
        .await
        .unwrap();
    assert!(routed.is_empty(), "marketing defaults to denied without an explicit opt-in");
}

#[tokio::test]
async fn failed_deliveries_are_reflected_in_the_analytics_summary() {
    let store = test_store().await;
    let since = Utc::now() - chrono::Duration::minutes(1);

    let delivered = notify_common::Delivery {
        id: "d-ok".to_string(),
        user_id: "u-1".to_string(),
        channel: Channel::Email,
        event_type: EventType::Account,
        event_id: "evt-ok".to_string(),
        status: notify_common::DeliveryStatus::Delivered,
        attempt_count: 1,
        metadata: serde_json::json!({}),
        error: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        delivered_at: Some(Utc::now()),
    };
    let failed = notify_common::Delivery {
        id: "d-fail".to_string(),
        status: notify_common::DeliveryStatus::Failed,
        event_id: "evt-fail".to_string(),
        ..delivered.clone()
    };

    store.record_delivery(&delivered).await.unwrap();
    store.record_delivery(&failed).await.unwrap();

    let summary = analytics::summarize_since(&store, since).await.unwrap();
    assert_eq!(summary.total_deliveries, 2);
    let email = &summary.by_channel[&Channel::Email];
    assert_eq!(email.delivered, 1);
    assert_eq!(email.failed, 1);
    assert_eq!(email.success_rate, 0.5);
}
