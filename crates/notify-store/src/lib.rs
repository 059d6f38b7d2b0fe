//! Relational access to the three reference tables the pipeline only ever
//! reads (users, preferences, templates) and the delivery audit log it
//! writes, behind one trait so stage binaries can be pointed at SQLite in
//! development and Postgres in production without code changes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify_common::{Channel, Delivery, DeliveryStatus, EventType, Preference, Template, User};

pub mod error;
pub mod sqlite;
pub mod postgres;

pub use error::StoreError;

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait NotifyStore: Send + Sync {
    async fn init_schema(&self) -> Result<()>;

    async fn get_user(&self, user_id: &str) -> Result<Option<User>>;

    async fn get_preference(
        &self,
        user_id: &str,
        channel: Channel,
        event_type: EventType,
    ) -> Result<Option<Preference>>;

    async fn get_template(&self, channel: Channel, event_type: EventType) -> Result<Option<Template>>;

    /// Insert the initial audit row for a delivery attempt.
    async fn record_delivery(&self, delivery: &Delivery) -> Result<()>;

    /// Update a delivery's terminal (or retry) status.
    async fn update_delivery_status(
        &self,
        id: &str,
        status: DeliveryStatus,
        attempt_count: i32,
        error: Option<String>,
        delivered_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// All delivery rows created at or after `since`, for analytics aggregation.
    async fn deliveries_since(&self, since: DateTime<Utc>) -> Result<Vec<Delivery>>;
}
