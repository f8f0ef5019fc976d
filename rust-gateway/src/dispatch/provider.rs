//! Per-provider dispatch settings.

use std::fmt;

use axum::http::HeaderMap;

use crate::config::Config;
use crate::handlers::{table_for, HandlerTable};
use crate::normalize::ProviderKind;
use crate::web::signature::SignatureFormat;

/// Header every provider may fall back to.
pub const GENERIC_SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Everything the dispatcher needs to know about one provider.
#[derive(Clone)]
pub struct ProviderProfile {
    pub kind: ProviderKind,
    /// Checked in order; the first present header wins
    pub signature_headers: Vec<&'static str>,
    pub signature_format: SignatureFormat,
    pub secret: Option<String>,
    /// Queue the event (true) or run the handler inline (false)
    pub queue_enabled: bool,
    pub table: HandlerTable,
}

impl ProviderProfile {
    pub fn from_config(kind: ProviderKind, config: &Config) -> Self {
        let (header, signature_format) = match kind {
            ProviderKind::Messaging => (
                "x-bird-signature",
                SignatureFormat::from_prefix(&config.bird_signature_prefix),
            ),
            ProviderKind::Pipeline => ("x-hubspot-signature", SignatureFormat::BareHex),
            ProviderKind::Calendar => ("x-calendar-signature", SignatureFormat::BareHex),
        };

        Self {
            kind,
            signature_headers: vec![header, GENERIC_SIGNATURE_HEADER],
            signature_format,
            secret: config.webhook_secret_for(kind).map(str::to_string),
            queue_enabled: config.queue_enabled_for(kind),
            table: table_for(kind),
        }
    }

    /// Profiles for every provider.
    pub fn all_from_config(config: &Config) -> Vec<Self> {
        ProviderKind::ALL
            .iter()
            .map(|kind| Self::from_config(*kind, config))
            .collect()
    }

    /// The signature header value, if any accepted header is present.
    pub fn signature<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        self.signature_headers
            .iter()
            .find_map(|name| headers.get(*name))
            .and_then(|value| value.to_str().ok())
    }
}

impl fmt::Debug for ProviderProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderProfile")
            .field("kind", &self.kind)
            .field("signature_headers", &self.signature_headers)
            .field("signature_format", &self.signature_format)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("queue_enabled", &self.queue_enabled)
            .field("routes", &self.table.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_messaging_profile() {
        let cfg = config(&[("BIRD_WEBHOOK_SECRET", "s3cret"), ("BIRD_QUEUE_ENABLED", "false")]);
        let profile = ProviderProfile::from_config(ProviderKind::Messaging, &cfg);

        assert_eq!(profile.signature_headers, vec!["x-bird-signature", "x-webhook-signature"]);
        assert_eq!(
            profile.signature_format,
            SignatureFormat::Prefixed("sha256=".to_string())
        );
        assert_eq!(profile.secret.as_deref(), Some("s3cret"));
        assert!(!profile.queue_enabled);
        assert!(profile.table.contains("message.failed"));
    }

    #[test]
    fn test_signature_header_fallback() {
        let cfg = config(&[]);
        let profile = ProviderProfile::from_config(ProviderKind::Pipeline, &cfg);

        let mut headers = HeaderMap::new();
        headers.insert("x-webhook-signature", HeaderValue::from_static("generic"));
        assert_eq!(profile.signature(&headers), Some("generic"));

        headers.insert("x-hubspot-signature", HeaderValue::from_static("specific"));
        assert_eq!(profile.signature(&headers), Some("specific"));

        assert_eq!(profile.signature(&HeaderMap::new()), None);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let cfg = config(&[("CALENDAR_WEBHOOK_SECRET", "do-not-print")]);
        let profile = ProviderProfile::from_config(ProviderKind::Calendar, &cfg);
        let rendered = format!("{:?}", profile);
        assert!(!rendered.contains("do-not-print"));
        assert!(rendered.contains("<redacted>"));
    }
}
