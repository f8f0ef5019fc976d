//! Webhook signature verification.
//!
//! Every provider signs the raw request body with HMAC-SHA256 and sends the
//! hex digest in a header. Providers differ only in how the digest is framed
//! (`sha256=<hex>` versus bare hex), captured by [`SignatureFormat`].

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// How a provider frames the hex digest inside its signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureFormat {
    /// Digest preceded by a fixed prefix, e.g. `sha256=`.
    Prefixed(String),
    /// Digest sent as bare hex.
    BareHex,
}

impl SignatureFormat {
    /// Build a format from a configured prefix; an empty prefix means bare hex.
    pub fn from_prefix(prefix: &str) -> Self {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            SignatureFormat::BareHex
        } else {
            SignatureFormat::Prefixed(prefix.to_string())
        }
    }

    fn digest_hex<'a>(&self, header: &'a str) -> Option<&'a str> {
        let header = header.trim();
        match self {
            SignatureFormat::BareHex => Some(header),
            SignatureFormat::Prefixed(prefix) => header.strip_prefix(prefix.as_str()),
        }
    }

    fn frame(&self, hex_digest: &str) -> String {
        match self {
            SignatureFormat::BareHex => hex_digest.to_string(),
            SignatureFormat::Prefixed(prefix) => format!("{}{}", prefix, hex_digest),
        }
    }
}

/// Verify a webhook signature against the raw request body.
///
/// # Arguments
///
/// * `raw_body` - The exact bytes received on the wire
/// * `signature_header` - The provider's signature header value, if any
/// * `secret` - The provider's webhook secret, if configured
/// * `format` - How the provider frames its digest
///
/// # Returns
///
/// `true` only when the header carries the HMAC-SHA256 of `raw_body` under
/// `secret`. A missing header, missing secret, wrong prefix, invalid hex or a
/// digest of the wrong length all yield `false`.
pub fn verify_signature(
    raw_body: &[u8],
    signature_header: Option<&str>,
    secret: Option<&str>,
    format: &SignatureFormat,
) -> bool {
    let (Some(header), Some(secret)) = (signature_header, secret) else {
        return false;
    };

    if !is_secret_configured(Some(secret)) || header.trim().is_empty() {
        return false;
    }

    let Some(hex_digest) = format.digest_hex(header) else {
        return false;
    };

    let provided = match hex::decode(hex_digest) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let Some(expected) = compute_digest(raw_body, secret) else {
        return false;
    };

    // The digest length is public (32 bytes), so rejecting other lengths
    // up front reveals nothing about the expected value.
    if provided.len() != expected.len() {
        return false;
    }

    expected.ct_eq(&provided).into()
}

/// Produce the header value a provider would send for `raw_body`.
pub fn sign_payload(raw_body: &[u8], secret: &str, format: &SignatureFormat) -> String {
    let digest = compute_digest(raw_body, secret).unwrap_or_default();
    format.frame(&hex::encode(digest))
}

/// Check whether a webhook secret is usable.
pub fn is_secret_configured(secret: Option<&str>) -> bool {
    secret.map(|s| !s.trim().is_empty()).unwrap_or(false)
}

fn compute_digest(raw_body: &[u8], secret: &str) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(raw_body);
    Some(mac.finalize().into_bytes().to_vec())
}
