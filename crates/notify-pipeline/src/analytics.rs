//! Analytics stage: read-only aggregation over the delivery audit trail.
//! No write path lives here — this stage only ever calls
//! [`NotifyStore::deliveries_since`].

use chrono::{DateTime, Utc};
use notify_common::{Channel, Delivery, DeliveryStatus, EventType, NotifyError, Result};
use notify_store::NotifyStore;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ChannelMetrics {
    pub attempted: u64,
    pub delivered: u64,
    pub failed: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AnalyticsSummary {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_deliveries: u64,
    pub overall_success_rate: f64,
    pub by_channel: HashMap<Channel, ChannelMetrics>,
    pub top_event_types: Vec<(EventType, u64)>,
}

fn is_terminal_success(status: DeliveryStatus) -> bool {
    matches!(status, DeliveryStatus::Delivered | DeliveryStatus::Sent)
}

fn is_terminal_failure(status: DeliveryStatus) -> bool {
    matches!(status, DeliveryStatus::Failed | DeliveryStatus::Bounced)
}

/// Aggregate a slice of delivery audit rows into a summary. Pure, so it's
/// testable without a store implementation.
fn summarize(deliveries: &[Delivery], period_start: DateTime<Utc>, period_end: DateTime<Utc>) -> AnalyticsSummary {
    let mut by_channel: HashMap<Channel, ChannelMetrics> = HashMap::new();
    let mut event_type_counts: HashMap<EventType, u64> = HashMap::new();
    let mut total_delivered = 0u64;
    let mut total_terminal = 0u64;

    for delivery in deliveries {
        let metrics = by_channel.entry(delivery.channel).or_default();
        metrics.attempted += 1;
        if is_terminal_success(delivery.status) {
            metrics.delivered += 1;
            total_delivered += 1;
            total_terminal += 1;
        } else if is_terminal_failure(delivery.status) {
            metrics.failed += 1;
            total_terminal += 1;
        }

        *event_type_counts.entry(delivery.event_type).or_insert(0) += 1;
    }

    for metrics in by_channel.values_mut() {
        let terminal = metrics.delivered + metrics.failed;
        metrics.success_rate = if terminal == 0 {
            0.0
        } else {
            metrics.delivered as f64 / terminal as f64
        };
    }

    let overall_success_rate = if total_terminal == 0 {
        0.0
    } else {
        total_delivered as f64 / total_terminal as f64
    };

    let mut top_event_types: Vec<(EventType, u64)> = event_type_counts.into_iter().collect();
    top_event_types.sort_by(|a, b| b.1.cmp(&a.1));
    top_event_types.truncate(10);

    AnalyticsSummary {
        period_start,
        period_end,
        total_deliveries: deliveries.len() as u64,
        overall_success_rate,
        by_channel,
        top_event_types,
    }
}

/// Build an [`AnalyticsSummary`] covering deliveries recorded since `since`.
pub async fn summarize_since(store: &dyn NotifyStore, since: DateTime<Utc>) -> Result<AnalyticsSummary> {
    let deliveries = store
        .deliveries_since(since)
        .await
        .map_err(|e| NotifyError::Store(e.to_string()))?;

    Ok(summarize(&deliveries, since, Utc::now()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delivery(channel: Channel, event_type: EventType, status: DeliveryStatus) -> Delivery {
        Delivery {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: "u1".to_string(),
            channel,
            event_type,
            event_id: "e1".to_string(),
            status,
            attempt_count: 1,
            metadata: json!({}),
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            delivered_at: None,
        }
    }

    #[test]
    fn computes_per_channel_success_rate() {
        let deliveries = vec![
            delivery(Channel::Email, EventType::Account, DeliveryStatus::Delivered),
            delivery(Channel::Email, EventType::Account, DeliveryStatus::Delivered),
            delivery(Channel::Email, EventType::Account, DeliveryStatus::Failed),
            delivery(Channel::Sms, EventType::Marketing, DeliveryStatus::Delivered),
        ];

        let summary = summarize(&deliveries, Utc::now(), Utc::now());
        assert_eq!(summary.total_deliveries, 4);

        let email = &summary.by_channel[&Channel::Email];
        assert_eq!(email.delivered, 2);
        assert_eq!(email.failed, 1);
        assert!((email.success_rate - (2.0 / 3.0)).abs() < 1e-9);

        let sms = &summary.by_channel[&Channel::Sms];
        assert_eq!(sms.success_rate, 1.0);
    }

    #[test]
    fn pending_deliveries_do_not_count_toward_success_rate() {
        let deliveries = vec![
            delivery(Channel::Push, EventType::Account, DeliveryStatus::Pending),
            delivery(Channel::Push, EventType::Account, DeliveryStatus::Delivered),
        ];

        let summary = summarize(&deliveries, Utc::now(), Utc::now());
        let push = &summary.by_channel[&Channel::Push];
        assert_eq!(push.attempted, 2);
        assert_eq!(push.success_rate, 1.0);
    }

    #[test]
    fn top_event_types_ranked_by_count() {
        let deliveries = vec![
            delivery(Channel::Email, EventType::Marketing, DeliveryStatus::Delivered),
            delivery(Channel::Email, EventType::Marketing, DeliveryStatus::Delivered),
            delivery(Channel::Email, EventType::Account, DeliveryStatus::Delivered),
        ];

        let summary = summarize(&deliveries, Utc::now(), Utc::now());
        assert_eq!(summary.top_event_types[0].0, EventType::Marketing);
        assert_eq!(summary.top_event_types[0].1, 2);
    }
}
