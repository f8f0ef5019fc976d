//! Webhook endpoint handlers.
//!
//! Provider endpoints hand the raw body to the [`Dispatcher`] untouched, since
//! signatures are computed over the exact bytes received.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::dispatch::{Acknowledgement, Dispatcher};
use crate::error::{DispatchError, Rejection};
use crate::normalize::ProviderKind;
use crate::queue::JobStatus;
use crate::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(config: Config, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config: Arc::new(config),
            dispatcher,
        }
    }
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn unknown_provider(provider: &str) -> Response {
    warn!(provider = %provider, "webhook_unknown_provider");
    Rejection::bare(DispatchError::UnknownProvider(provider.to_string())).into_response()
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Provider Webhooks
// =============================================================================

/// `POST /webhooks/:provider`
pub async fn provider_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(kind) = ProviderKind::from_route(&provider) else {
        return unknown_provider(&provider);
    };

    match state.dispatcher.dispatch(kind, &headers, &body).await {
        Ok(ack) => ack.into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ChallengeQuery {
    pub challenge: Option<String>,
}

/// `GET /webhooks/:provider/verify?challenge=...`
///
/// Echoes the challenge so providers can confirm endpoint ownership.
pub async fn verify_challenge(
    Path(provider): Path<String>,
    Query(query): Query<ChallengeQuery>,
) -> Response {
    let Some(kind) = ProviderKind::from_route(&provider) else {
        return unknown_provider(&provider);
    };

    match query.challenge.filter(|c| !c.is_empty()) {
        Some(challenge) => {
            info!(provider = %kind, "webhook_challenge_answered");
            (StatusCode::OK, challenge).into_response()
        }
        None => json_error(StatusCode::BAD_REQUEST, "Missing challenge parameter"),
    }
}

/// `GET /webhooks/whatsapp/verify`
///
/// WhatsApp Business subscription handshake.
pub async fn whatsapp_verify(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token").map(String::as_str);
    let challenge = params.get("hub.challenge");

    let expected = state.config.whatsapp_verify_token.as_deref();
    let token_matches = matches!((token, expected), (Some(t), Some(e)) if t == e);

    match (mode, challenge) {
        (Some("subscribe"), Some(challenge)) if token_matches => {
            info!("whatsapp_webhook_verified");
            (StatusCode::OK, challenge.clone()).into_response()
        }
        _ => {
            warn!(
                mode = ?mode,
                token_configured = expected.is_some(),
                "whatsapp_webhook_verification_failed"
            );
            json_error(StatusCode::FORBIDDEN, "Verification failed")
        }
    }
}

// =============================================================================
// Job Status
// =============================================================================

/// `GET /webhooks/status/:job_id`
pub async fn job_status(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    match state.dispatcher.queue().status(&job_id).await {
        Ok(Some(record)) => {
            let mut body = json!({
                "jobId": job_id,
                "status": record.status.as_str(),
                "updatedAt": record.updated_at.to_rfc3339(),
                "timestamp": Utc::now().to_rfc3339(),
            });
            if let Some(map) = body.as_object_mut() {
                match &record.status {
                    JobStatus::Retrying { attempt } => {
                        map.insert("attempt".to_string(), json!(attempt));
                    }
                    JobStatus::DeadLettered { reason } => {
                        map.insert("reason".to_string(), json!(reason));
                    }
                    _ => {}
                }
            }
            (StatusCode::OK, Json(body)).into_response()
        }
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Job not found"),
        Err(e) => {
            error!(job_id = %job_id, error = %e, "job_status_lookup_failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

// =============================================================================
// Manual Processing
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ManualSubmission {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub event: Option<Value>,
}

/// `POST /webhooks/process`
///
/// Operator tool: queues `{source, event}` without a signature check.
pub async fn manual_process(State(state): State<AppState>, body: Bytes) -> Response {
    if !state.config.manual_processing_enabled {
        warn!("manual_processing_disabled");
        return json_error(StatusCode::FORBIDDEN, "Manual processing is disabled");
    }

    let submission: ManualSubmission = match serde_json::from_slice(&body) {
        Ok(submission) => submission,
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "Request body is not valid JSON"),
    };

    let (Some(source), Some(event)) = (submission.source, submission.event) else {
        return json_error(
            StatusCode::BAD_REQUEST,
            "Missing required fields: source, event",
        );
    };

    let Some(kind) = ProviderKind::from_route(&source) else {
        return json_error(StatusCode::BAD_REQUEST, &format!("Unknown source: {}", source));
    };

    match state.dispatcher.submit_manual(kind, &event).await {
        Ok(Acknowledgement::Accepted {
            webhook_id,
            job_id,
            duplicate,
        }) => {
            let message = if duplicate {
                "Event already queued"
            } else {
                "Event queued for processing"
            };
            (
                StatusCode::ACCEPTED,
                Json(json!({
                    "message": message,
                    "jobId": job_id,
                    "webhookId": webhook_id,
                    "timestamp": Utc::now().to_rfc3339(),
                })),
            )
                .into_response()
        }
        Ok(ack) => ack.into_response(),
        Err(rejection) => rejection.into_response(),
    }
}
