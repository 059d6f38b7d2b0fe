use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify_common::{Channel, Delivery, DeliveryStatus, EventType, Preference, Template, User};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::{NotifyStore, Result, StoreError};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn parse_preference(row: &sqlx::sqlite::SqliteRow) -> Result<Preference> {
        let channel: String = row.get("channel");
        let event_type: String = row.get("event_type");
        let quiet_start: Option<String> = row.get("quiet_hours_start");
        let quiet_end: Option<String> = row.get("quiet_hours_end");
        let created_at_ts: i64 = row.get("created_at");
        let updated_at_ts: i64 = row.get("updated_at");

        Ok(Preference {
            user_id: row.get("user_id"),
            channel: Channel::parse(&channel)
                .ok_or_else(|| StoreError::Database(format!("unknown channel {channel}")))?,
            event_type: EventType::parse(&event_type)
                .ok_or_else(|| StoreError::Database(format!("unknown event_type {event_type}")))?,
            enabled: row.get::<i64, _>("enabled") != 0,
            quiet_hours_start: quiet_start
                .map(|s| chrono::NaiveTime::parse_from_str(&s, "%H:%M:%S"))
                .transpose()
                .map_err(|e| StoreError::Database(e.to_string()))?,
            quiet_hours_end: quiet_end
                .map(|s| chrono::NaiveTime::parse_from_str(&s, "%H:%M:%S"))
                .transpose()
                .map_err(|e| StoreError::Database(e.to_string()))?,
            created_at: DateTime::from_timestamp(created_at_ts, 0)
                .ok_or_else(|| StoreError::Database("invalid created_at".to_string()))?,
            updated_at: DateTime::from_timestamp(updated_at_ts, 0)
                .ok_or_else(|| StoreError::Database("invalid updated_at".to_string()))?,
        })
    }

    fn parse_delivery(row: &sqlx::sqlite::SqliteRow) -> Result<Delivery> {
        let channel: String = row.get("channel");
        let event_type: String = row.get("event_type");
        let status: String = row.get("status");
        let metadata: String = row.get("metadata");
        let created_at_ts: i64 = row.get("created_at");
        let updated_at_ts: i64 = row.get("updated_at");
        let delivered_at_ts: Option<i64> = row.get("delivered_at");

        Ok(Delivery {
            id: row.get("id"),
            user_id: row.get("user_id"),
            channel: Channel::parse(&channel)
                .ok_or_else(|| StoreError::Database(format!("unknown channel {channel}")))?,
            event_type: EventType::parse(&event_type)
                .ok_or_else(|| StoreError::Database(format!("unknown event_type {event_type}")))?,
            event_id: row.get("event_id"),
            status: DeliveryStatus::parse(&status)
                .ok_or_else(|| StoreError::Database(format!("unknown status {status}")))?,
            attempt_count: row.get("attempt_count"),
            metadata: serde_json::from_str(&metadata)?,
            error: row.get("error"),
            created_at: DateTime::from_timestamp(created_at_ts, 0)
                .ok_or_else(|| StoreError::Database("invalid created_at".to_string()))?,
            updated_at: DateTime::from_timestamp(updated_at_ts, 0)
                .ok_or_else(|| StoreError::Database("invalid updated_at".to_string()))?,
            delivered_at: delivered_at_ts.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        })
    }
}

#[async_trait]
impl NotifyStore for SqliteStore {
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                phone TEXT,
                push_tokens TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS preferences (
                user_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                event_type TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                quiet_hours_start TEXT,
                quiet_hours_end TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, channel, event_type)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS templates (
                channel TEXT NOT NULL,
                event_type TEXT NOT NULL,
                subject TEXT,
                body TEXT NOT NULL,
                variables TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (channel, event_type)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deliveries (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                event_type TEXT NOT NULL,
                event_id TEXT NOT NULL,
                status TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                metadata TEXT NOT NULL DEFAULT '{}',
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                delivered_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_deliveries_created_at ON deliveries (created_at)")
            .execute(&self.pool)
            .await?;

        info!("notify-store SQLite schema initialized");
        Ok(())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, email, phone, push_tokens FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };
        let push_tokens: String = row.get("push_tokens");

        Ok(Some(User {
            id: row.get("id"),
            email: row.get("email"),
            phone: row.get("phone"),
            push_tokens: serde_json::from_str(&push_tokens)?,
        }))
    }

    async fn get_preference(
        &self,
        user_id: &str,
        channel: Channel,
        event_type: EventType,
    ) -> Result<Option<Preference>> {
        let row = sqlx::query(
            "SELECT user_id, channel, event_type, enabled, quiet_hours_start, quiet_hours_end, created_at, updated_at \
             FROM preferences WHERE user_id = ? AND channel = ? AND event_type = ?",
        )
        .bind(user_id)
        .bind(channel.as_str())
        .bind(event_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::parse_preference(&r)).transpose()
    }

    async fn get_template(&self, channel: Channel, event_type: EventType) -> Result<Option<Template>> {
        let row = sqlx::query(
            "SELECT channel, event_type, subject, body, variables FROM templates WHERE channel = ? AND event_type = ?",
        )
        .bind(channel.as_str())
        .bind(event_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let variables: String = row.get("variables");

        Ok(Some(Template {
            channel,
            event_type,
            subject: row.get("subject"),
            body: row.get("body"),
            variables: serde_json::from_str(&variables)?,
        }))
    }

    async fn record_delivery(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO deliveries (id, user_id, channel, event_type, event_id, status, attempt_count, metadata, error, created_at, updated_at, delivered_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&delivery.id)
        .bind(&delivery.user_id)
        .bind(delivery.channel.as_str())
        .bind(delivery.event_type.as_str())
        .bind(&delivery.event_id)
        .bind(delivery.status.as_str())
        .bind(delivery.attempt_count)
        .bind(serde_json::to_string(&delivery.metadata)?)
        .bind(&delivery.error)
        .bind(delivery.created_at.timestamp())
        .bind(delivery.updated_at.timestamp())
        .bind(delivery.delivered_at.map(|d| d.timestamp()))
        .execute(&self.pool)
        .await?;

        debug!(delivery_id = %delivery.id, "recorded delivery attempt");
        Ok(())
    }

    async fn update_delivery_status(
        &self,
        id: &str,
        status: DeliveryStatus,
        attempt_count: i32,
        error: Option<String>,
        delivered_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE deliveries
            SET status = ?, attempt_count = ?, error = ?, updated_at = ?, delivered_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(attempt_count)
        .bind(&error)
        .bind(Utc::now().timestamp())
        .bind(delivered_at.map(|d| d.timestamp()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn deliveries_since(&self, since: DateTime<Utc>) -> Result<Vec<Delivery>> {
        let rows = sqlx::query(
            "SELECT id, user_id, channel, event_type, event_id, status, attempt_count, metadata, error, created_at, updated_at, delivered_at \
             FROM deliveries WHERE created_at >= ? ORDER BY created_at ASC",
        )
        .bind(since.timestamp())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_delivery).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn get_user_returns_none_when_absent() {
        let store = store().await;
        assert!(store.get_user("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_and_update_delivery_round_trips() {
        let store = store().await;
        let now = Utc::now();
        let delivery = Delivery {
            id: "d1".to_string(),
            user_id: "u1".to_string(),
            channel: Channel::Email,
            event_type: EventType::Account,
            event_id: "e1".to_string(),
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            metadata: serde_json::json!({}),
            error: None,
            created_at: now,
            updated_at: now,
            delivered_at: None,
        };
        store.record_delivery(&delivery).await.unwrap();

        store
            .update_delivery_status("d1", DeliveryStatus::Delivered, 1, None, Some(now))
            .await
            .unwrap();

        let fetched = store.deliveries_since(now - chrono::Duration::seconds(5)).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].status, DeliveryStatus::Delivered);
        assert_eq!(fetched[0].attempt_count, 1);
    }
}
