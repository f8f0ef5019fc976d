//! Bird webhook payload normalization.
//!
//! Bird conversation events carry `id`, `type` and `timestamp` at the top
//! level next to `conversation`, `contact`, `message` and `agent` objects.
//! Channel events use `event` instead of `type`. The whole body is kept as the
//! envelope payload since handlers read those sibling objects directly.

use serde_json::{Map, Value};
use tracing::debug;

use super::{
    id_field, required_timestamp, string_field, NormalizationError, ProviderKind,
    WebhookEnvelope,
};
use crate::util::ids::fallback_event_id;

/// Normalize a Bird webhook body.
pub fn normalize_bird(body: &Map<String, Value>) -> Result<WebhookEnvelope, NormalizationError> {
    let event_type = string_field(body, "type")
        .or_else(|| string_field(body, "event"))
        .ok_or(NormalizationError::MissingField("type"))?;

    let timestamp = required_timestamp(body, &["timestamp"])?;

    let id = id_field(body, "id").unwrap_or_else(|| {
        let generated = fallback_event_id(body);
        debug!(event_type = %event_type, generated_id = %generated, "bird_event_id_fallback");
        generated
    });

    Ok(WebhookEnvelope {
        id,
        event_type,
        timestamp,
        source: ProviderKind::Messaging,
        origin: None,
        payload: body.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_conversation_event() {
        let body = object(json!({
            "id": "evt_123",
            "type": "conversation.started",
            "timestamp": "2024-05-01T10:00:00Z",
            "conversation": {"id": "conv_1", "status": "active", "channel": "whatsapp"},
            "contact": {"id": "ct_1", "msisdn": "+525512345678", "name": "Ana López"}
        }));

        let envelope = normalize_bird(&body).unwrap();

        assert_eq!(envelope.id, "evt_123");
        assert_eq!(envelope.event_type, "conversation.started");
        assert_eq!(envelope.source, ProviderKind::Messaging);
        assert_eq!(envelope.payload["contact"]["id"], "ct_1");
    }

    #[test]
    fn test_channel_event_uses_event_key() {
        let body = object(json!({
            "event": "message.failed",
            "timestamp": "2024-05-01T10:00:00Z",
            "data": {"id": "msg_1", "to": "+525512345678"}
        }));

        let envelope = normalize_bird(&body).unwrap();

        assert_eq!(envelope.event_type, "message.failed");
        assert!(envelope.id.starts_with("evt_"));
    }

    #[test]
    fn test_missing_timestamp() {
        let body = object(json!({"id": "evt_1", "type": "message.received"}));
        let err = normalize_bird(&body).unwrap_err();
        assert!(matches!(err, NormalizationError::MissingField("timestamp")));
    }

    #[test]
    fn test_blank_type_is_missing() {
        let body = object(json!({"type": "  ", "timestamp": "2024-05-01T10:00:00Z"}));
        let err = normalize_bird(&body).unwrap_err();
        assert!(matches!(err, NormalizationError::MissingField("type")));
    }

    #[test]
    fn test_fallback_id_is_stable() {
        let body = object(json!({"type": "message.read", "timestamp": "2024-05-01T10:00:00Z"}));
        let a = normalize_bird(&body).unwrap();
        let b = normalize_bird(&body).unwrap();
        assert_eq!(a.id, b.id);
    }
}
