//! Identifier generation.
//!
//! Webhook ids correlate one delivery across logs, responses and queue jobs.
//! Event and job ids are deterministic so a redelivered event maps to the same
//! job.

use chrono::Utc;
use rand::Rng;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::normalize::{ProviderKind, WebhookEnvelope};

const SUFFIX_LEN: usize = 9;

/// Generate a correlation id for one inbound delivery.
///
/// Format: `<provider>_<epoch-millis>_<9 base36 chars>`.
pub fn generate_webhook_id(kind: ProviderKind) -> String {
    format!(
        "{}_{}_{}",
        kind.route_name(),
        Utc::now().timestamp_millis(),
        random_suffix(SUFFIX_LEN)
    )
}

fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| std::char::from_digit(rng.gen_range(0..36), 36).unwrap_or('0'))
        .collect()
}

/// Derive an event id from the body when the provider sent none.
///
/// `serde_json::Map` keeps keys sorted, so equal bodies hash equally
/// regardless of the key order on the wire.
pub fn fallback_event_id(body: &Map<String, Value>) -> String {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let hash = hex::encode(Sha256::digest(&bytes));
    format!("evt_{}", &hash[..32])
}

/// Queue job id for an envelope. Same provider and event id, same job.
pub fn job_id_for(envelope: &WebhookEnvelope) -> String {
    format!("{}:{}", envelope.source.route_name(), envelope.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_webhook_id_format() {
        let id = generate_webhook_id(ProviderKind::Messaging);
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "bird");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), SUFFIX_LEN);
        assert!(parts[2].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_webhook_ids_are_unique() {
        let a = generate_webhook_id(ProviderKind::Calendar);
        let b = generate_webhook_id(ProviderKind::Calendar);
        assert_ne!(a, b);
    }

    #[test]
    fn test_fallback_event_id_ignores_key_order() {
        let a: Map<String, Value> = serde_json::from_str(r#"{"a":1,"b":"x"}"#).unwrap();
        let b: Map<String, Value> = serde_json::from_str(r#"{"b":"x","a":1}"#).unwrap();
        let c = json!({"a": 2, "b": "x"}).as_object().cloned().unwrap();
        assert_eq!(fallback_event_id(&a), fallback_event_id(&b));
        assert_ne!(fallback_event_id(&a), fallback_event_id(&c));
        assert_eq!(fallback_event_id(&a).len(), 36);
    }
}
