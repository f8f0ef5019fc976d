//! Web server module for inbound webhooks.
//!
//! This module provides the HTTP surface that:
//! - Receives webhooks from Bird, HubSpot and calendar relays
//! - Answers provider verification handshakes
//! - Reports queued job status

pub mod handlers;
pub mod signature;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{
    health, job_status, manual_process, provider_webhook, verify_challenge, whatsapp_verify,
    AppState, HealthResponse,
};
pub use signature::{is_secret_configured, sign_payload, verify_signature, SignatureFormat};

/// Largest webhook body accepted.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Build the application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/whatsapp/verify", get(whatsapp_verify))
        .route("/webhooks/status/:job_id", get(job_status))
        .route("/webhooks/process", post(manual_process))
        .route("/webhooks/:provider", post(provider_webhook))
        .route("/webhooks/:provider/verify", get(verify_challenge))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
