use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::{CacheError, NotificationCache, Result};

/// Lua script: increment a counter, and only on its first increment within
/// the window set its expiry — avoids the race between INCR and EXPIRE
/// resetting the TTL on every call.
const INCR_WITH_WINDOW: &str = r#"
local count = redis.call("INCR", KEYS[1])
if count == 1 then
    redis.call("EXPIRE", KEYS[1], ARGV[1])
end
return count
"#;

pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| CacheError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl NotificationCache for RedisCache {
    async fn check_and_set_dedup(&self, key: &str, ttl_seconds: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await?;

        let is_new = result.is_some();
        debug!(key = %key, is_new, "dedup check");
        Ok(is_new)
    }

    async fn increment_rate_limit(&self, key: &str, window_seconds: u64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = redis::Script::new(INCR_WITH_WINDOW)
            .key(key)
            .arg(window_seconds)
            .invoke_async(&mut conn)
            .await?;

        debug!(key = %key, count, "rate limit increment");
        Ok(count)
    }

    async fn publish_notification(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
