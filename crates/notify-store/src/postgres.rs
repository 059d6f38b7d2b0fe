use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify_common::{Channel, Delivery, DeliveryStatus, EventType, Preference, Template, User};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::{NotifyStore, Result, StoreError};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn parse_preference(row: &sqlx::postgres::PgRow) -> Result<Preference> {
        let channel: String = row.get("channel");
        let event_type: String = row.get("event_type");

        Ok(Preference {
            user_id: row.get("user_id"),
            channel: Channel::parse(&channel)
                .ok_or_else(|| StoreError::Database(format!("unknown channel {channel}")))?,
            event_type: EventType::parse(&event_type)
                .ok_or_else(|| StoreError::Database(format!("unknown event_type {event_type}")))?,
            enabled: row.get("enabled"),
            quiet_hours_start: row.get("quiet_hours_start"),
            quiet_hours_end: row.get("quiet_hours_end"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn parse_delivery(row: &sqlx::postgres::PgRow) -> Result<Delivery> {
        let channel: String = row.get("channel");
        let event_type: String = row.get("event_type");
        let status: String = row.get("status");
        let metadata: serde_json::Value = row.get("metadata");

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
            metadata,
            error: row.get("error"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            delivered_at: row.get("delivered_at"),
        })
    }
}

#[async_trait]
impl NotifyStore for PostgresStore {
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                phone TEXT,
                push_tokens JSONB NOT NULL DEFAULT '[]'
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
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                quiet_hours_start TIME,
                quiet_hours_end TIME,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
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
                variables JSONB NOT NULL DEFAULT '[]',
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
                metadata JSONB NOT NULL DEFAULT '{}',
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                delivered_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_deliveries_created_at ON deliveries (created_at)")
            .execute(&self.pool)
            .await?;

        info!("notify-store Postgres schema initialized");
        Ok(())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, email, phone, push_tokens FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };
        let push_tokens: serde_json::Value = row.get("push_tokens");

        Ok(Some(User {
            id: row.get("id"),
            email: row.get("email"),
            phone: row.get("phone"),
            push_tokens: serde_json::from_value(push_tokens)?,
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
             FROM preferences WHERE user_id = $1 AND channel = $2 AND event_type = $3",
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
            "SELECT channel, event_type, subject, body, variables FROM templates WHERE channel = $1 AND event_type = $2",
        )
        .bind(channel.as_str())
        .bind(event_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let variables: serde_json::Value = row.get("variables");

        Ok(Some(Template {
            channel,
            event_type,
            subject: row.get("subject"),
            body: row.get("body"),
            variables: serde_json::from_value(variables)?,
        }))
    }

    async fn record_delivery(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO deliveries (id, user_id, channel, event_type, event_id, status, attempt_count, metadata, error, created_at, updated_at, delivered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&delivery.id)
        .bind(&delivery.user_id)
        .bind(delivery.channel.as_str())
        .bind(delivery.event_type.as_str())
        .bind(&delivery.event_id)
        .bind(delivery.status.as_str())
        .bind(delivery.attempt_count)
        .bind(&delivery.metadata)
        .bind(&delivery.error)
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .bind(delivery.delivered_at)
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
            SET status = $1, attempt_count = $2, error = $3, updated_at = $4, delivered_at = $5
            WHERE id = $6
            "#,
        )
        .bind(status.as_str())
        .bind(attempt_count)
        .bind(&error)
        .bind(Utc::now())
        .bind(delivered_at)
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
             FROM deliveries WHERE created_at >= $1 ORDER BY created_at ASC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_delivery).collect()
    }
}
