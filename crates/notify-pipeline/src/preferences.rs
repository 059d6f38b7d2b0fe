//! Preference stage: narrows an enriched event's requested channels down
//! to the ones the recipient actually allows, applying explicit
//! disables, quiet hours, the marketing default-deny rule, and a sliding
//! rate limit.

use chrono::{NaiveTime, Utc};
use notify_cache::NotificationCache;
use notify_common::{EnrichedEvent, NotifyError, Result, RoutedEvent};
use notify_store::NotifyStore;
use tracing::debug;

/// Default for how many requests per `(user_id, channel, event_type)` per
/// hour rule 4 allows before denying; overridable via `NOTIFY_RATE_LIMIT_PER_HOUR`.
pub const DEFAULT_RATE_LIMIT: u64 = 10;
const RATE_LIMIT_WINDOW_SECONDS: u64 = 3600;

/// Whether `now` falls within a quiet-hours window that may wrap past
/// midnight (e.g. 22:00-07:00 UTC).
fn in_quiet_hours(now: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        now >= start && now < end
    } else {
        now >= start || now < end
    }
}

fn channel_allowed(event: &EnrichedEvent, preference: Option<&notify_common::Preference>) -> bool {
    match preference {
        Some(pref) => {
            if !pref.enabled {
                return false;
            }
            if let (Some(start), Some(end)) = (pref.quiet_hours_start, pref.quiet_hours_end) {
                let now_time = Utc::now().time();
                if in_quiet_hours(now_time, start, end) {
                    return false;
                }
            }
            true
        }
        None => event.event_type != notify_common::EventType::Marketing,
    }
}

/// Filter `event.channels` down to the ones allowed by preference, returning
/// one [`RoutedEvent`] per allowed channel.
pub async fn route(
    event: &EnrichedEvent,
    store: &dyn NotifyStore,
    cache: &dyn NotificationCache,
    rate_limit_per_hour: u64,
) -> Result<Vec<RoutedEvent>> {
    let mut routed = Vec::with_capacity(event.channels.len());

    for &channel in &event.channels {
        let preference = store
            .get_preference(&event.user_id, channel, event.event_type)
            .await
            .map_err(|e| NotifyError::Store(e.to_string()))?;

        if !channel_allowed(event, preference.as_ref()) {
            debug!(event_id = %event.event_id, %channel, "channel filtered out by preference");
            continue;
        }

        // Rule 4: only a channel that survived rules 1-3 advances the
        // counter — an earlier denial must not consume it.
        let rate_limit_key = format!("ratelimit:{}:{}:{}", event.user_id, channel, event.event_type);
        let count = cache
            .increment_rate_limit(&rate_limit_key, RATE_LIMIT_WINDOW_SECONDS)
            .await
            .map_err(|e| NotifyError::Cache(e.to_string()))?;
        if count > rate_limit_per_hour {
            debug!(event_id = %event.event_id, %channel, count, "channel filtered out by rate limit");
            continue;
        }

        routed.push(RoutedEvent {
            event_id: event.event_id.clone(),
            event_type: event.event_type,
            user_id: event.user_id.clone(),
            channel,
            priority: event.priority,
            data: event.data.clone(),
            created_at: event.created_at,
            user_email: event.user_email.clone(),
            user_phone: event.user_phone.clone(),
            user_push_tokens: event.user_push_tokens.clone(),
        });
    }

    Ok(routed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use notify_cache::memory::InMemoryCache;
    use notify_common::{Channel, EventType, Priority};

    #[test]
    fn quiet_hours_window_wraps_past_midnight() {
        let start = NaiveTime::from_hms_opt(22, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(7, 0, 0).unwrap();

        assert!(in_quiet_hours(NaiveTime::from_hms_opt(23, 30, 0).unwrap(), start, end));
        assert!(in_quiet_hours(NaiveTime::from_hms_opt(3, 0, 0).unwrap(), start, end));
        assert!(!in_quiet_hours(NaiveTime::from_hms_opt(12, 0, 0).unwrap(), start, end));
    }

    #[test]
    fn quiet_hours_window_same_day_does_not_wrap() {
        let start = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(17, 0, 0).unwrap();

        assert!(in_quiet_hours(NaiveTime::from_hms_opt(12, 0, 0).unwrap(), start, end));
        assert!(!in_quiet_hours(NaiveTime::from_hms_opt(20, 0, 0).unwrap(), start, end));
    }

    #[test]
    fn marketing_event_with_no_preference_row_defaults_to_denied() {
        let event = sample_event(EventType::Marketing);
        assert!(!channel_allowed(&event, None));
    }

    #[test]
    fn account_event_with_no_preference_row_defaults_to_allowed() {
        let event = sample_event(EventType::Account);
        assert!(channel_allowed(&event, None));
    }

    #[tokio::test]
    async fn eleventh_event_within_the_hour_is_denied_by_the_rate_limit() {
        use notify_store::sqlite::SqliteStore;
        use sqlx::sqlite::SqlitePoolOptions;

        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let store = SqliteStore::new(pool);
        store.init_schema().await.unwrap();
        let cache = InMemoryCache::new();

        for _ in 0..10 {
            let routed = route(&sample_event(EventType::Account), &store, &cache, DEFAULT_RATE_LIMIT)
                .await
                .unwrap();
            assert_eq!(routed.len(), 1);
        }

        let eleventh = route(&sample_event(EventType::Account), &store, &cache, DEFAULT_RATE_LIMIT)
            .await
            .unwrap();
        assert!(eleventh.is_empty());
    }

    #[tokio::test]
    async fn rule_4_does_not_increment_when_an_earlier_rule_already_denied() {
        use notify_store::sqlite::SqliteStore;
        use sqlx::sqlite::SqlitePoolOptions;

        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let store = SqliteStore::new(pool);
        store.init_schema().await.unwrap();
        let cache = InMemoryCache::new();

        for _ in 0..20 {
            let routed = route(&sample_event(EventType::Marketing), &store, &cache, DEFAULT_RATE_LIMIT)
                .await
                .unwrap();
            assert!(routed.is_empty());
        }

        let key = format!("ratelimit:u1:{}:{}", Channel::Email, EventType::Marketing);
        assert_eq!(cache.increment_rate_limit(&key, 3600).await.unwrap(), 1);
    }

    fn sample_event(event_type: EventType) -> EnrichedEvent {
        EnrichedEvent {
            event_id: "e1".to_string(),
            event_type,
            user_id: "u1".to_string(),
            channels: vec![Channel::Email],
            priority: Priority::Normal,
            data: Default::default(),
            scheduled_at: None,
            expires_at: None,
            metadata: None,
            created_at: Utc::now(),
            enriched_at: Utc::now(),
            user_email: Some("a@example.com".to_string()),
            user_phone: None,
            user_push_tokens: vec![],
        }
    }
}
