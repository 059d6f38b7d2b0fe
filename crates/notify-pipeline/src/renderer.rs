//! Renderer stage: substitutes `{{name}}` placeholders in a channel's
//! template with values from the event's data payload.

use chrono::Utc;
use notify_common::{NotifyError, RenderContext, RenderedNotification, RenderedValue, Result, RoutedEvent, Template};
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

fn placeholder_regex() -> &'static Regex {
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").unwrap())
}

fn substitute(body: &str, context: &RenderContext) -> String {
    placeholder_regex()
        .replace_all(body, |caps: &regex::Captures| {
            let name = &caps[1];
            context
                .get(name)
                .map(RenderedValue::to_substitution_string)
                .unwrap_or_default()
        })
        .into_owned()
}

fn build_context(routed: &RoutedEvent) -> RenderContext {
    routed
        .data
        .iter()
        .map(|(k, v)| (k.clone(), RenderedValue::from_json(v)))
        .collect()
}

pub fn render(routed: RoutedEvent, template: &Template) -> Result<RenderedNotification> {
    if template.channel != routed.channel || template.event_type != routed.event_type {
        return Err(NotifyError::Validation(format!(
            "template {:?}/{:?} does not match routed event {:?}/{:?}",
            template.channel, template.event_type, routed.channel, routed.event_type
        )));
    }

    let context = build_context(&routed);
    let subject = template.subject.as_ref().map(|s| substitute(s, &context));
    let body = substitute(&template.body, &context);

    debug!(event_id = %routed.event_id, channel = %routed.channel, "rendered notification");

    Ok(RenderedNotification {
        event_id: routed.event_id,
        event_type: routed.event_type,
        user_id: routed.user_id,
        channel: routed.channel,
        priority: routed.priority,
        subject,
        body,
        created_at: routed.created_at,
        rendered_at: Utc::now(),
        user_email: routed.user_email,
        user_phone: routed.user_phone,
        user_push_tokens: routed.user_push_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_common::{Channel, EventType, Priority};
    use std::collections::HashMap;

    fn routed_event() -> RoutedEvent {
        let mut data = HashMap::new();
        data.insert("userName".to_string(), serde_json::json!("Alice"));
        data.insert("appName".to_string(), serde_json::json!("Acme"));

        RoutedEvent {
            event_id: "e1".to_string(),
            event_type: EventType::Account,
            user_id: "u1".to_string(),
            channel: Channel::Email,
            priority: Priority::Normal,
            data,
            created_at: Utc::now(),
            user_email: Some("alice@example.com".to_string()),
            user_phone: None,
            user_push_tokens: vec![],
        }
    }

    #[test]
    fn substitutes_known_placeholders() {
        let template = Template {
            channel: Channel::Email,
            event_type: EventType::Account,
            subject: Some("Welcome to {{appName}}".to_string()),
            body: "Hi {{userName}}, welcome to {{appName}}!".to_string(),
            variables: vec!["userName".to_string(), "appName".to_string()],
        };

        let rendered = render(routed_event(), &template).unwrap();
        assert_eq!(rendered.subject.as_deref(), Some("Welcome to Acme"));
        assert_eq!(rendered.body, "Hi Alice, welcome to Acme!");
    }

    #[test]
    fn missing_placeholder_substitutes_empty_string() {
        let template = Template {
            channel: Channel::Email,
            event_type: EventType::Account,
            subject: None,
            body: "Code: {{otp}}".to_string(),
            variables: vec!["otp".to_string()],
        };

        let rendered = render(routed_event(), &template).unwrap();
        assert_eq!(rendered.body, "Code: ");
    }

    #[test]
    fn mismatched_template_is_rejected() {
        let template = Template {
            channel: Channel::Sms,
            event_type: EventType::Account,
            subject: None,
            body: "x".to_string(),
            variables: vec![],
        };

        assert!(render(routed_event(), &template).is_err());
    }
}
