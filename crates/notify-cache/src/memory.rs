use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::{NotificationCache, Result};

/// In-process stand-in for Redis, used in pipeline tests so dedup and
/// rate-limit behavior can be exercised without a running broker.
#[derive(Default)]
pub struct InMemoryCache {
    dedup: Mutex<HashMap<String, i64>>,
    counters: Mutex<HashMap<String, (u64, i64)>>,
    published: Mutex<Vec<(String, String)>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }
}

#[async_trait]
impl NotificationCache for InMemoryCache {
    async fn check_and_set_dedup(&self, key: &str, ttl_seconds: u64) -> Result<bool> {
        let now = Self::now();
        let mut dedup = self.dedup.lock();

        if let Some(expires_at) = dedup.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }

        dedup.insert(key.to_string(), now + ttl_seconds as i64);
        Ok(true)
    }

    async fn increment_rate_limit(&self, key: &str, window_seconds: u64) -> Result<u64> {
        let now = Self::now();
        let mut counters = self.counters.lock();

        let entry = counters.entry(key.to_string()).or_insert((0, now + window_seconds as i64));
        if now >= entry.1 {
            *entry = (0, now + window_seconds as i64);
        }
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn publish_notification(&self, channel: &str, payload: &str) -> Result<()> {
        self.published.lock().push((channel.to_string(), payload.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dedup_rejects_second_call_within_ttl() {
        let cache = InMemoryCache::new();
        assert!(cache.check_and_set_dedup("evt-1", 60).await.unwrap());
        assert!(!cache.check_and_set_dedup("evt-1", 60).await.unwrap());
    }

    #[tokio::test]
    async fn rate_limit_counts_up_within_window() {
        let cache = InMemoryCache::new();
        assert_eq!(cache.increment_rate_limit("user-1", 3600).await.unwrap(), 1);
        assert_eq!(cache.increment_rate_limit("user-1", 3600).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn publish_notification_is_recorded() {
        let cache = InMemoryCache::new();
        cache.publish_notification("ws:notifications", "{}").await.unwrap();
        assert_eq!(cache.published().len(), 1);
    }
}
