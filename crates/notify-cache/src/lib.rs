//! Ephemeral, TTL-bearing state shared across stage processes: the
//! idempotency dedup set, per-user sliding-window rate-limit counters, and
//! the live-notification pub/sub channel the (out-of-scope) client-facing
//! layer subscribes to. Modeled on this codebase's Redis leader-election
//! pattern of atomic check-and-set via `SET NX` and Lua scripts for
//! compound operations.

use async_trait::async_trait;

pub mod error;
pub mod memory;
pub mod redis_cache;

pub use error::CacheError;

pub type Result<T> = std::result::Result<T, CacheError>;

#[async_trait]
pub trait NotificationCache: Send + Sync {
    /// Atomically mark `key` as seen with the given TTL. Returns `true` if
    /// this call was the first to set it (process should continue),
    /// `false` if it was already present (process should skip as a
    /// duplicate).
    async fn check_and_set_dedup(&self, key: &str, ttl_seconds: u64) -> Result<bool>;

    /// Atomically increment the sliding-window counter for `key`, setting
    /// its expiry to `window_seconds` only on the first increment of the
    /// window. Returns the counter's new value.
    async fn increment_rate_limit(&self, key: &str, window_seconds: u64) -> Result<u64>;

    /// Publish a rendered notification onto the live channel for
    /// (out-of-scope) downstream fan-out subscribers.
    async fn publish_notification(&self, channel: &str, payload: &str) -> Result<()>;
}
