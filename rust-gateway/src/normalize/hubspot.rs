//! HubSpot webhook payload normalization.
//!
//! HubSpot names its fields differently from the canonical envelope:
//! `subscriptionType` is the event type and `occurredAt` (epoch millis) the
//! timestamp. The mapping happens first, then the usual required-field checks
//! apply to the mapped values.

use serde::Deserialize;
use serde_json::{Map, Value};

use super::{parse_timestamp, NormalizationError, ProviderKind, WebhookEnvelope};
use crate::util::ids::fallback_event_id;

/// One HubSpot webhook event.
///
/// Field names match HubSpot's camelCase JSON. `type` and `timestamp` are
/// accepted too, for senders that already speak the canonical shape.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubSpotEvent {
    #[serde(default)]
    pub event_id: Option<Value>,
    #[serde(default)]
    pub subscription_type: Option<String>,
    #[serde(default)]
    pub occurred_at: Option<Value>,
    #[serde(default)]
    pub object_id: Option<Value>,
    #[serde(default)]
    pub portal_id: Option<Value>,
    #[serde(default)]
    pub property_name: Option<String>,
    #[serde(default)]
    pub property_value: Option<Value>,
    #[serde(default)]
    pub change_source: Option<String>,
    #[serde(default, rename = "type")]
    pub canonical_type: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

impl HubSpotEvent {
    fn event_type(&self) -> Option<String> {
        self.subscription_type
            .as_deref()
            .or(self.canonical_type.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn occurred_at(&self) -> Option<&Value> {
        self.occurred_at
            .as_ref()
            .or(self.timestamp.as_ref())
            .filter(|v| !v.is_null())
    }

    fn event_id(&self) -> Option<String> {
        match self.event_id.as_ref()? {
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            _ => None,
        }
    }
}

/// Normalize a HubSpot webhook body.
pub fn normalize_hubspot(
    body: &Map<String, Value>,
) -> Result<WebhookEnvelope, NormalizationError> {
    let event: HubSpotEvent = serde_json::from_value(Value::Object(body.clone())).map_err(
        |source| NormalizationError::InvalidShape {
            provider: "hubspot",
            source,
        },
    )?;

    let event_type = event
        .event_type()
        .ok_or(NormalizationError::MissingField("type"))?;

    let timestamp = event
        .occurred_at()
        .ok_or(NormalizationError::MissingField("timestamp"))
        .and_then(parse_timestamp)?;

    let id = event.event_id().unwrap_or_else(|| fallback_event_id(body));

    Ok(WebhookEnvelope {
        id,
        event_type,
        timestamp,
        source: ProviderKind::Pipeline,
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
    fn test_property_change_event() {
        let body = object(json!({
            "eventId": 1001,
            "subscriptionId": 7,
            "portalId": 123,
            "occurredAt": 1714557600000i64,
            "subscriptionType": "contact.propertyChange",
            "objectId": 555,
            "propertyName": "lifecyclestage",
            "propertyValue": "lead",
            "changeSource": "CRM_UI"
        }));

        let envelope = normalize_hubspot(&body).unwrap();

        assert_eq!(envelope.id, "1001");
        assert_eq!(envelope.event_type, "contact.propertyChange");
        assert_eq!(envelope.timestamp.timestamp_millis(), 1714557600000);
        assert_eq!(envelope.source, ProviderKind::Pipeline);
        assert_eq!(envelope.payload["propertyName"], "lifecyclestage");
    }

    #[test]
    fn test_subscription_type_without_occurred_at_is_malformed() {
        let body = object(json!({"subscriptionType": "contact.propertyChange"}));
        let err = normalize_hubspot(&body).unwrap_err();
        assert!(matches!(err, NormalizationError::MissingField("timestamp")));
    }

    #[test]
    fn test_canonical_fields_are_accepted() {
        let body = object(json!({
            "type": "deal.closed",
            "timestamp": "2024-05-01T10:00:00Z",
            "objectId": "777"
        }));
        let envelope = normalize_hubspot(&body).unwrap();
        assert_eq!(envelope.event_type, "deal.closed");
    }

    #[test]
    fn test_wrong_field_type_is_invalid_shape() {
        let body = object(json!({"subscriptionType": 42, "occurredAt": 1714557600000i64}));
        let err = normalize_hubspot(&body).unwrap_err();
        assert!(matches!(err, NormalizationError::InvalidShape { .. }));
    }
}
