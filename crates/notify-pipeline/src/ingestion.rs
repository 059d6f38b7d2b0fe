//! Ingestion stage: validates a submitted event, deduplicates it, and
//! resolves the recipient's contact data into an [`EnrichedEvent`].

use chrono::Utc;
use notify_cache::NotificationCache;
use notify_common::{EnrichedEvent, NotifyError, Result, SubmittedEvent};
use notify_store::NotifyStore;
use tracing::{debug, warn};

/// Prefix for the dedup key so event ids never collide with rate-limit
/// keys in the shared ephemeral store namespace.
const DEDUP_KEY_PREFIX: &str = "dedup:event:";

#[derive(Debug)]
pub enum IngestOutcome {
    Enriched(EnrichedEvent),
    /// The event id was already processed within the dedup TTL window.
    Duplicate,
    /// `expires_at` had already passed by the time the event was ingested.
    Expired,
}

pub async fn ingest(
    event: SubmittedEvent,
    store: &dyn NotifyStore,
    cache: &dyn NotificationCache,
    dedup_ttl_seconds: u64,
) -> Result<IngestOutcome> {
    if event.event_id.trim().is_empty() {
        return Err(NotifyError::Validation("event_id must not be empty".to_string()));
    }
    if event.channels.is_empty() {
        return Err(NotifyError::Validation("channels must not be empty".to_string()));
    }

    let now = Utc::now();

    if let Some(expires_at) = event.expires_at {
        if expires_at <= now {
            warn!(event_id = %event.event_id, "event expired before ingestion, dropping");
            return Ok(IngestOutcome::Expired);
        }
    }

    let dedup_key = format!("{DEDUP_KEY_PREFIX}{}", event.event_id);
    let is_new = cache
        .check_and_set_dedup(&dedup_key, dedup_ttl_seconds)
        .await
        .map_err(|e| NotifyError::Cache(e.to_string()))?;

    if !is_new {
        debug!(event_id = %event.event_id, "duplicate event, skipping");
        return Ok(IngestOutcome::Duplicate);
    }

    let user = store
        .get_user(&event.user_id)
        .await
        .map_err(|e| NotifyError::Store(e.to_string()))?;

    let enriched = match user {
        Some(user) => EnrichedEvent {
            event_id: event.event_id,
            event_type: event.event_type,
            user_id: event.user_id,
            channels: event.channels,
            priority: event.priority,
            data: event.data,
            scheduled_at: event.scheduled_at,
            expires_at: event.expires_at,
            metadata: event.metadata,
            created_at: event.created_at,
            enriched_at: now,
            user_email: Some(user.email),
            user_phone: user.phone,
            user_push_tokens: user.push_tokens,
        },
        None => {
            warn!(event_id = %event.event_id, user_id = %event.user_id, "user not found, enriching without contact data");
            EnrichedEvent::without_contact(event, now)
        }
    };

    Ok(IngestOutcome::Enriched(enriched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_cache::memory::InMemoryCache;
    use notify_common::{Channel, EventType, Priority, User};
    use notify_store::sqlite::SqliteStore;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashMap;

    async fn store_with_user() -> SqliteStore {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let store = SqliteStore::new(pool);
        store.init_schema().await.unwrap();
        sqlx::query("INSERT INTO users (id, email, phone, push_tokens) VALUES (?, ?, ?, ?)")
            .bind("u1")
            .bind("alice@example.com")
            .bind(Option::<String>::None)
            .bind("[]")
            .execute(store.pool())
            .await
            .unwrap();
        store
    }

    fn sample_event(event_id: &str, user_id: &str) -> SubmittedEvent {
        SubmittedEvent {
            event_id: event_id.to_string(),
            event_type: EventType::Account,
            user_id: user_id.to_string(),
            channels: vec![Channel::Email],
            priority: Priority::Normal,
            data: HashMap::new(),
            scheduled_at: None,
            expires_at: None,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn enriches_with_contact_data_when_user_exists() {
        let store = store_with_user().await;
        let cache = InMemoryCache::new();

        let outcome = ingest(sample_event("e1", "u1"), &store, &cache, 3600).await.unwrap();
        match outcome {
            IngestOutcome::Enriched(enriched) => {
                assert_eq!(enriched.user_email.as_deref(), Some("alice@example.com"));
            }
            _ => panic!("expected enriched event"),
        }
    }

    #[tokio::test]
    async fn degrades_gracefully_when_user_missing() {
        let store = store_with_user().await;
        let cache = InMemoryCache::new();

        let outcome = ingest(sample_event("e2", "ghost"), &store, &cache, 3600).await.unwrap();
        match outcome {
            IngestOutcome::Enriched(enriched) => {
                assert!(enriched.user_email.is_none());
            }
            _ => panic!("expected enriched event"),
        }
    }

    #[tokio::test]
    async fn second_ingestion_of_same_event_id_is_a_duplicate() {
        let store = store_with_user().await;
        let cache = InMemoryCache::new();

        ingest(sample_event("e3", "u1"), &store, &cache, 3600).await.unwrap();
        let second = ingest(sample_event("e3", "u1"), &store, &cache, 3600).await.unwrap();
        assert!(matches!(second, IngestOutcome::Duplicate));
    }

    #[tokio::test]
    async fn expired_event_is_dropped() {
        let store = store_with_user().await;
        let cache = InMemoryCache::new();

        let mut event = sample_event("e4", "u1");
        event.expires_at = Some(Utc::now() - chrono::Duration::seconds(60));

        let outcome = ingest(event, &store, &cache, 3600).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Expired));
    }
}
