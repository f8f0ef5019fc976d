//! Calendar webhook payload normalization.
//!
//! Calendly, Google and Outlook relays disagree on field names, so each
//! canonical field has a short list of candidates checked in order. The
//! booking itself lives under `event` or `data` and becomes the payload.

use serde_json::{Map, Value};

use super::{
    id_field, required_timestamp, string_field, NormalizationError, ProviderKind,
    WebhookEnvelope,
};
use crate::util::ids::fallback_event_id;

/// Normalize a calendar webhook body.
///
/// `origin` is the `x-calendar-source` header, when the relay sent one.
pub fn normalize_calendar(
    body: &Map<String, Value>,
    origin: Option<&str>,
) -> Result<WebhookEnvelope, NormalizationError> {
    let event_type = string_field(body, "event_type")
        .or_else(|| string_field(body, "type"))
        .ok_or(NormalizationError::MissingField("type"))?;

    let timestamp = required_timestamp(body, &["timestamp", "created_at"])?;

    let payload = ["event", "data"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_object))
        .cloned()
        .ok_or(NormalizationError::MissingField("payload"))?;

    let id = id_field(body, "id")
        .or_else(|| id_field(&payload, "id"))
        .unwrap_or_else(|| fallback_event_id(body));

    let origin = origin
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_ascii_lowercase);

    Ok(WebhookEnvelope {
        id,
        event_type,
        timestamp,
        source: ProviderKind::Calendar,
        origin,
        payload,
    })
}
