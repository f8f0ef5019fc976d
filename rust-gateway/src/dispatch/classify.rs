//! Event classification: priority and handler route.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::handlers::{HandlerTable, Route};
use crate::normalize::WebhookEnvelope;

/// Event types that page somebody.
const CRITICAL_EVENTS: &[&str] = &["system.error", "integration.failure"];

/// Event types that start or close a lead's journey.
const HIGH_EVENTS: &[&str] = &["conversation.started", "booking.created", "deal.closed"];

/// Queue priority of a job.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// AMQP message priority on a queue declared with `x-max-priority = 10`.
    pub fn amqp_priority(&self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 5,
            Priority::High => 8,
            Priority::Critical => 10,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

/// Priority for an event type. Critical is checked before high.
pub fn priority_for(event_type: &str) -> Priority {
    if CRITICAL_EVENTS.contains(&event_type) {
        Priority::Critical
    } else if HIGH_EVENTS.contains(&event_type) {
        Priority::High
    } else {
        Priority::Normal
    }
}

/// Result of classifying one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub priority: Priority,
    pub route: Route,
    /// False when the event fell through to the default route
    pub matched: bool,
}

/// Classify an envelope against its provider's table. Never fails.
pub fn classify(envelope: &WebhookEnvelope, table: &HandlerTable) -> Classification {
    let priority = priority_for(&envelope.event_type);

    match table.resolve(&envelope.event_type) {
        Some(route) => Classification {
            priority,
            route: *route,
            matched: true,
        },
        None => {
            debug!(
                provider = %envelope.source,
                event_type = %envelope.event_type,
                "webhook_unroutable_event"
            );
            Classification {
                priority,
                route: *table.fallback(),
                matched: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{table_for, DEFAULT_ROUTE};
    use crate::normalize::ProviderKind;
    use chrono::Utc;
    use serde_json::Map;

    fn envelope(source: ProviderKind, event_type: &str) -> WebhookEnvelope {
        WebhookEnvelope {
            id: "evt_1".to_string(),
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            source,
            origin: None,
            payload: Map::new(),
        }
    }

    #[test]
    fn test_priority_sets() {
        assert_eq!(priority_for("system.error"), Priority::Critical);
        assert_eq!(priority_for("integration.failure"), Priority::Critical);
        assert_eq!(priority_for("conversation.started"), Priority::High);
        assert_eq!(priority_for("booking.created"), Priority::High);
        assert_eq!(priority_for("deal.closed"), Priority::High);
        assert_eq!(priority_for("message.received"), Priority::Normal);
        assert_eq!(priority_for(""), Priority::Normal);
    }

    #[test]
    fn test_amqp_priorities_are_ordered() {
        assert_eq!(Priority::Low.amqp_priority(), 1);
        assert_eq!(Priority::Normal.amqp_priority(), 5);
        assert_eq!(Priority::High.amqp_priority(), 8);
        assert_eq!(Priority::Critical.amqp_priority(), 10);
        assert!(Priority::Critical > Priority::High);
    }

    #[test]
    fn test_classify_matches_provider_route() {
        let table = table_for(ProviderKind::Messaging);
        let c = classify(&envelope(ProviderKind::Messaging, "conversation.started"), &table);
        assert_eq!(c.priority, Priority::High);
        assert_eq!(c.route.name, "conversation.started");
        assert!(c.matched);
    }

    #[test]
    fn test_unknown_type_falls_back_to_default() {
        let table = table_for(ProviderKind::Pipeline);
        let c = classify(&envelope(ProviderKind::Pipeline, "foo.bar"), &table);
        assert_eq!(c.priority, Priority::Normal);
        assert_eq!(c.route.name, DEFAULT_ROUTE);
        assert!(!c.matched);
    }

    #[test]
    fn test_classify_is_pure() {
        let table = table_for(ProviderKind::Calendar);
        let e = envelope(ProviderKind::Calendar, "booking.created");
        assert_eq!(classify(&e, &table), classify(&e, &table));
    }

    #[test]
    fn test_critical_without_route_still_critical() {
        let table = table_for(ProviderKind::Messaging);
        let c = classify(&envelope(ProviderKind::Messaging, "system.error"), &table);
        assert_eq!(c.priority, Priority::Critical);
        assert_eq!(c.route.name, DEFAULT_ROUTE);
    }
}
