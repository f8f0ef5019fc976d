//! Webhook payload normalization.
//!
//! Each provider ships its own payload shape. This module maps all of them
//! onto a single [`WebhookEnvelope`] so classification and handlers never look
//! at provider-specific framing.
//!
//! ## Normalization Flow
//!
//! ```text
//! raw JSON body → normalize(provider) → WebhookEnvelope | NormalizationError
//! ```

pub mod bird;
pub mod calendar;
pub mod hubspot;

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use bird::normalize_bird;
pub use calendar::normalize_calendar;
pub use hubspot::normalize_hubspot;

/// The external system a webhook came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Bird conversations and messages
    Messaging,
    /// HubSpot CRM pipeline
    Pipeline,
    /// Calendly / Google / Outlook bookings
    Calendar,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Messaging,
        ProviderKind::Pipeline,
        ProviderKind::Calendar,
    ];

    /// Resolve the `{provider}` path segment of a webhook route.
    pub fn from_route(segment: &str) -> Option<Self> {
        match segment.to_ascii_lowercase().as_str() {
            "bird" | "messaging" => Some(ProviderKind::Messaging),
            "hubspot" | "pipeline" => Some(ProviderKind::Pipeline),
            "calendar" => Some(ProviderKind::Calendar),
            _ => None,
        }
    }

    /// Path segment and log label for this provider.
    pub fn route_name(&self) -> &'static str {
        match self {
            ProviderKind::Messaging => "bird",
            ProviderKind::Pipeline => "hubspot",
            ProviderKind::Calendar => "calendar",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.route_name())
    }
}

/// Canonical, provider-agnostic representation of one inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    /// Provider event id, or a content hash when the provider sent none
    pub id: String,
    /// Dot-namespaced event category, e.g. `message.received`
    #[serde(rename = "type")]
    pub event_type: String,
    /// When the provider says the event happened
    pub timestamp: DateTime<Utc>,
    /// Originating provider
    pub source: ProviderKind,
    /// Calendar sub-source (`calendly`, `google`, `outlook`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Provider fields, preserved verbatim
    pub payload: Map<String, Value>,
}

/// Why a raw body could not become an envelope.
#[derive(Debug, Error)]
pub enum NormalizationError {
    #[error("webhook body is not a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid timestamp `{0}`")]
    InvalidTimestamp(String),

    #[error("invalid {provider} payload: {source}")]
    InvalidShape {
        provider: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Normalize a raw webhook body from `source` into an envelope.
///
/// `origin` carries the calendar sub-source header and is ignored for other
/// providers.
pub fn normalize(
    source: ProviderKind,
    raw: &Value,
    origin: Option<&str>,
) -> Result<WebhookEnvelope, NormalizationError> {
    let body = raw.as_object().ok_or(NormalizationError::NotAnObject)?;

    match source {
        ProviderKind::Messaging => normalize_bird(body),
        ProviderKind::Pipeline => normalize_hubspot(body),
        ProviderKind::Calendar => normalize_calendar(body, origin),
    }
}

/// Read a non-empty string field.
pub(crate) fn string_field(body: &Map<String, Value>, key: &str) -> Option<String> {
    match body.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Read an identifier that providers send either as a string or a number.
pub(crate) fn id_field(body: &Map<String, Value>, key: &str) -> Option<String> {
    match body.get(key)? {
        Value::Number(n) => Some(n.to_string()),
        other => string_field_value(other),
    }
}

fn string_field_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Parse a provider timestamp.
///
/// Accepts RFC 3339 strings and epoch milliseconds, either as a JSON number
/// or as a string of digits.
pub(crate) fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, NormalizationError> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Ok(ts.with_timezone(&Utc));
            }
            s.parse::<i64>()
                .ok()
                .and_then(from_epoch_millis)
                .ok_or_else(|| NormalizationError::InvalidTimestamp(s.to_string()))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(from_epoch_millis)
            .ok_or_else(|| NormalizationError::InvalidTimestamp(n.to_string())),
        other => Err(NormalizationError::InvalidTimestamp(other.to_string())),
    }
}

fn from_epoch_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Look up a required timestamp among candidate keys, in order.
pub(crate) fn required_timestamp(
    body: &Map<String, Value>,
    keys: &[&str],
) -> Result<DateTime<Utc>, NormalizationError> {
    let value = keys
        .iter()
        .filter_map(|k| body.get(*k))
        .find(|v| !v.is_null())
        .ok_or(NormalizationError::MissingField("timestamp"))?;
    parse_timestamp(value)
}
