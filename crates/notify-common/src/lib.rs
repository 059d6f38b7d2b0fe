use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod logging;

// ============================================================================
// Enums shared across every stage
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Push,
    InApp,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Email, Channel::Sms, Channel::Push, Channel::InApp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Push => "push",
            Channel::InApp => "in_app",
        }
    }

    pub fn parse(s: &str) -> Option<Channel> {
        match s {
            "email" => Some(Channel::Email),
            "sms" => Some(Channel::Sms),
            "push" => Some(Channel::Push),
            "in_app" => Some(Channel::InApp),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Account,
    Security,
    Marketing,
    System,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Account => "account",
            EventType::Security => "security",
            EventType::Marketing => "marketing",
            EventType::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<EventType> {
        match s {
            "account" => Some(EventType::Account),
            "security" => Some(EventType::Security),
            "marketing" => Some(EventType::Marketing),
            "system" => Some(EventType::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Delivery audit row status. Mirrors the teacher's `OutboxStatus` in spirit
/// (a closed set of terminal/non-terminal states used for retry decisions)
/// but uses the vocabulary spec.md §3 names for a `Delivery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Bounced,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Bounced => "bounced",
        }
    }

    pub fn parse(s: &str) -> Option<DeliveryStatus> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            "failed" => Some(DeliveryStatus::Failed),
            "bounced" => Some(DeliveryStatus::Bounced),
            _ => None,
        }
    }
}

// ============================================================================
// Notification event, by stage
// ============================================================================

/// The event as submitted by the external HTTP layer onto `notifications.events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmittedEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub user_id: String,
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Submitted fields plus resolved recipient contact data (§3, Enriched).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub user_id: String,
    pub channels: Vec<Channel>,
    pub priority: Priority,
    pub data: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub enriched_at: DateTime<Utc>,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub user_phone: Option<String>,
    #[serde(default)]
    pub user_push_tokens: Vec<String>,
}

impl EnrichedEvent {
    /// Build an enriched event from a submitted one, without contact fields —
    /// the explicit "missing user" degrade path in spec.md §4.1.
    pub fn without_contact(submitted: SubmittedEvent, enriched_at: DateTime<Utc>) -> Self {
        Self {
            event_id: submitted.event_id,
            event_type: submitted.event_type,
            user_id: submitted.user_id,
            channels: submitted.channels,
            priority: submitted.priority,
            data: submitted.data,
            scheduled_at: submitted.scheduled_at,
            expires_at: submitted.expires_at,
            metadata: submitted.metadata,
            created_at: submitted.created_at,
            enriched_at,
            user_email: None,
            user_phone: None,
            user_push_tokens: Vec::new(),
        }
    }
}

/// Enriched fields narrowed to a single allowed channel (§3, Routed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutedEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub user_id: String,
    pub channel: Channel,
    pub priority: Priority,
    pub data: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub user_phone: Option<String>,
    #[serde(default)]
    pub user_push_tokens: Vec<String>,
}

/// Routed fields plus the rendered wire-ready body (§3, Rendered).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderedNotification {
    pub event_id: String,
    pub event_type: EventType,
    pub user_id: String,
    pub channel: Channel,
    pub priority: Priority,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub rendered_at: DateTime<Utc>,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub user_phone: Option<String>,
    #[serde(default)]
    pub user_push_tokens: Vec<String>,
}

/// A rendered message plus failure context, published to the DLQ subject (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    #[serde(flatten)]
    pub notification: RenderedNotification,
    pub error: String,
    pub moved_to_dlq_at: DateTime<Utc>,
}

// ============================================================================
// Reference data the core reads but never writes (§3)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub push_tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preference {
    pub user_id: String,
    pub channel: Channel,
    pub event_type: EventType,
    pub enabled: bool,
    pub quiet_hours_start: Option<NaiveTime>,
    pub quiet_hours_end: Option<NaiveTime>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub channel: Channel,
    pub event_type: EventType,
    pub subject: Option<String>,
    pub body: String,
    pub variables: Vec<String>,
}

/// Audit row written by delivery workers (§3, Delivery).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    pub user_id: String,
    pub channel: Channel,
    pub event_type: EventType,
    pub event_id: String,
    pub status: DeliveryStatus,
    pub attempt_count: i32,
    pub metadata: serde_json::Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Rendering context (Design Notes: model as an explicit sum type, not
// ad-hoc string-keyed values)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RenderedValue {
    String(String),
    Number(serde_json::Number),
    Bool(bool),
    Null,
}

impl RenderedValue {
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => RenderedValue::String(s.clone()),
            serde_json::Value::Number(n) => RenderedValue::Number(n.clone()),
            serde_json::Value::Bool(b) => RenderedValue::Bool(*b),
            serde_json::Value::Null => RenderedValue::Null,
            other => RenderedValue::String(other.to_string()),
        }
    }

    /// Render to the substitution string: empty for null, else the natural
    /// display form.
    pub fn to_substitution_string(&self) -> String {
        match self {
            RenderedValue::String(s) => s.clone(),
            RenderedValue::Number(n) => n.to_string(),
            RenderedValue::Bool(b) => b.to_string(),
            RenderedValue::Null => String::new(),
        }
    }
}

pub type RenderContext = HashMap<String, RenderedValue>;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("transient infrastructure error: {0}")]
    Transient(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NotifyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_round_trips_through_str() {
        for channel in Channel::ALL {
            assert_eq!(Channel::parse(channel.as_str()), Some(channel));
        }
    }

    #[test]
    fn rendered_value_null_substitutes_to_empty_string() {
        assert_eq!(RenderedValue::Null.to_substitution_string(), "");
    }

    #[test]
    fn submitted_event_deserializes_scenario_a_shape() {
        let json = r#"{
            "event_id": "e1",
            "event_type": "account",
            "user_id": "u1",
            "channels": ["email"],
            "priority": "normal",
            "data": {"appName": "Acme", "userName": "Alice"},
            "created_at": "2026-01-01T00:00:00Z"
        }"#;
        let event: SubmittedEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_id, "e1");
        assert_eq!(event.channels, vec![Channel::Email]);
    }
}
