use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::{EmbeddedQueue, Message, QueueConsumer, QueueError, QueueMetrics, QueuePublisher, QueuedMessage, Result};

/// SQLite-backed broker for local development and tests. One instance
/// covers one subject; `ack_wait_seconds` plays the role of JetStream's
/// AckWait.
pub struct SqliteQueue {
    pool: Pool<Sqlite>,
    subject: String,
    ack_wait_seconds: u32,
    running: AtomicBool,
}

impl SqliteQueue {
    pub fn new(pool: Pool<Sqlite>, subject: String, ack_wait_seconds: u32) -> Self {
        Self {
            pool,
            subject,
            ack_wait_seconds,
            running: AtomicBool::new(true),
        }
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_messages (
                id TEXT PRIMARY KEY,
                subject TEXT NOT NULL,
                receipt_handle TEXT,
                visible_at INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                receive_count INTEGER NOT NULL DEFAULT 0,
                UNIQUE(subject, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_visible
            ON queue_messages (subject, visible_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(subject = %self.subject, "SQLite queue schema initialized");
        Ok(())
    }

    fn generate_receipt_handle(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

#[async_trait]
impl QueueConsumer for SqliteQueue {
    fn identifier(&self) -> &str {
        &self.subject
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<QueuedMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let now = Utc::now().timestamp();
        let new_visible_at = now + self.ack_wait_seconds as i64;

        let rows = sqlx::query(
            r#"
            SELECT id, payload, receive_count
            FROM queue_messages
            WHERE subject = ? AND visible_at <= ?
            ORDER BY created_at
            LIMIT ?
            "#,
        )
        .bind(&self.subject)
        .bind(now)
        .bind(max_messages as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());

        for row in rows {
            let id: String = row.get("id");
            let payload: String = row.get("payload");
            let receive_count: i64 = row.get("receive_count");

            let receipt_handle = self.generate_receipt_handle();

            let updated = sqlx::query(
                r#"
                UPDATE queue_messages
                SET receipt_handle = ?, visible_at = ?, receive_count = receive_count + 1
                WHERE id = ? AND subject = ? AND visible_at <= ?
                "#,
            )
            .bind(&receipt_handle)
            .bind(new_visible_at)
            .bind(&id)
            .bind(&self.subject)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() == 0 {
                continue;
            }

            let value: serde_json::Value = serde_json::from_str(&payload)?;

            messages.push(QueuedMessage {
                message: Message::new(id.clone(), value),
                receipt_handle,
                broker_message_id: Some(id),
                queue_identifier: self.subject.clone(),
                redelivery_count: receive_count as u32,
            });
        }

        if !messages.is_empty() {
            debug!(subject = %self.subject, count = messages.len(), "polled messages");
        }

        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE receipt_handle = ? AND subject = ?")
            .bind(receipt_handle)
            .bind(&self.subject)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            warn!(receipt_handle = %receipt_handle, subject = %self.subject, "ack failed, message not found");
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        let delay = delay_seconds.unwrap_or(0) as i64;
        let new_visible_at = Utc::now().timestamp() + delay;

        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = ?, receipt_handle = NULL
            WHERE receipt_handle = ? AND subject = ?
            "#,
        )
        .bind(new_visible_at)
        .bind(receipt_handle)
        .bind(&self.subject)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(receipt_handle = %receipt_handle, subject = %self.subject, "nack failed, message not found");
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        let new_visible_at = Utc::now().timestamp() + seconds as i64;

        let result = sqlx::query(
            "UPDATE queue_messages SET visible_at = ? WHERE receipt_handle = ? AND subject = ?",
        )
        .bind(new_visible_at)
        .bind(receipt_handle)
        .bind(&self.subject)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(subject = %self.subject, "queue consumer stopped");
    }

    async fn get_metrics(&self) -> Result<Option<QueueMetrics>> {
        let now = Utc::now().timestamp();

        let pending: i64 = sqlx::query(
            "SELECT COUNT(*) as count FROM queue_messages WHERE subject = ? AND visible_at <= ? AND receipt_handle IS NULL",
        )
        .bind(&self.subject)
        .bind(now)
        .fetch_one(&self.pool)
        .await?
        .get("count");

        let in_flight: i64 = sqlx::query(
            "SELECT COUNT(*) as count FROM queue_messages WHERE subject = ? AND receipt_handle IS NOT NULL",
        )
        .bind(&self.subject)
        .fetch_one(&self.pool)
        .await?
        .get("count");

        Ok(Some(QueueMetrics {
            pending_messages: pending as u64,
            in_flight_messages: in_flight as u64,
            queue_identifier: self.subject.clone(),
        }))
    }
}

#[async_trait]
impl QueuePublisher for SqliteQueue {
    fn identifier(&self) -> &str {
        &self.subject
    }

    async fn publish(&self, message: Message) -> Result<String> {
        let now = Utc::now();
        let payload = serde_json::to_string(&message.payload)?;

        let existing = sqlx::query("SELECT id FROM queue_messages WHERE id = ? AND subject = ?")
            .bind(&message.id)
            .bind(&self.subject)
            .fetch_optional(&self.pool)
            .await?;

        if existing.is_some() {
            debug!(message_id = %message.id, subject = %self.subject, "duplicate publish, skipping");
            return Ok(message.id);
        }

        sqlx::query(
            r#"
            INSERT INTO queue_messages (id, subject, visible_at, payload, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&self.subject)
        .bind(now.timestamp())
        .bind(&payload)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(message.id)
    }

    async fn publish_batch(&self, messages: Vec<Message>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            ids.push(self.publish(message).await?);
        }
        Ok(ids)
    }
}

#[async_trait]
impl EmbeddedQueue for SqliteQueue {
    async fn init_schema(&self) -> Result<()> {
        self.create_schema().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_queue() -> SqliteQueue {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let queue = SqliteQueue::new(pool, "notifications.events".to_string(), 30);
        queue.init_schema().await.unwrap();
        queue
    }

    #[tokio::test]
    async fn publish_then_poll_returns_message_with_zero_redelivery_count() {
        let queue = create_test_queue().await;
        queue
            .publish(Message::new("evt-1", serde_json::json!({"hello": "world"})))
            .await
            .unwrap();

        let messages = queue.poll(10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].redelivery_count, 0);

        queue.ack(&messages[0].receipt_handle).await.unwrap();
        assert!(queue.poll(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn nack_increments_redelivery_count_on_next_poll() {
        let queue = create_test_queue().await;
        queue
            .publish(Message::new("evt-2", serde_json::json!({})))
            .await
            .unwrap();

        let first = queue.poll(10).await.unwrap();
        queue.nack(&first[0].receipt_handle, Some(0)).await.unwrap();

        let second = queue.poll(10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].redelivery_count, 1);
    }

    #[tokio::test]
    async fn duplicate_publish_is_idempotent() {
        let queue = create_test_queue().await;
        let msg = Message::new("evt-3", serde_json::json!({}));
        queue.publish(msg.clone()).await.unwrap();
        queue.publish(msg).await.unwrap();

        let messages = queue.poll(10).await.unwrap();
        assert_eq!(messages.len(), 1);
    }
}
