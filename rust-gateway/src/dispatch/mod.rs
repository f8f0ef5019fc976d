//! Webhook dispatch pipeline.
//!
//! ## Dispatch Flow
//!
//! ```text
//! Received → Verified → Normalized → Classified → Queued   → 202 Accepted
//!     │          │           │                  └→ Executed → 200 Processed
//!     └──────────┴───────────┴─→ Rejected (401 / 400 / 500)
//! ```
//!
//! Queued vs inline execution is fixed per provider at startup.

pub mod classify;
pub mod provider;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

pub use classify::{classify, priority_for, Classification, Priority};
pub use provider::{ProviderProfile, GENERIC_SIGNATURE_HEADER};

use crate::error::{DispatchError, Rejection};
use crate::handlers::{HandlerContext, HandlerError, Route};
use crate::normalize::{normalize, ProviderKind, WebhookEnvelope};
use crate::queue::{DispatchJob, JobQueue, RetryPolicy};
use crate::util::ids::generate_webhook_id;
use crate::web::signature::{is_secret_configured, verify_signature};

/// Header carrying the calendar sub-source.
pub const CALENDAR_SOURCE_HEADER: &str = "x-calendar-source";

/// A delivery that made it through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Handed to the job queue
    Accepted {
        webhook_id: String,
        job_id: String,
        duplicate: bool,
    },
    /// Handler ran inline and succeeded
    Processed {
        webhook_id: String,
        processing_time: Duration,
    },
}

impl Acknowledgement {
    pub fn webhook_id(&self) -> &str {
        match self {
            Acknowledgement::Accepted { webhook_id, .. }
            | Acknowledgement::Processed { webhook_id, .. } => webhook_id,
        }
    }
}

impl IntoResponse for Acknowledgement {
    fn into_response(self) -> Response {
        match self {
            Acknowledgement::Accepted {
                webhook_id,
                job_id,
                duplicate,
            } => {
                let (status, message) = if duplicate {
                    ("duplicate", "Webhook already queued")
                } else {
                    ("accepted", "Webhook queued for processing")
                };
                (
                    StatusCode::ACCEPTED,
                    Json(json!({
                        "status": status,
                        "webhookId": webhook_id,
                        "jobId": job_id,
                        "message": message,
                    })),
                )
                    .into_response()
            }
            Acknowledgement::Processed {
                webhook_id,
                processing_time,
            } => (
                StatusCode::OK,
                Json(json!({
                    "status": "processed",
                    "webhookId": webhook_id,
                    "processingTime": processing_time.as_millis() as u64,
                })),
            )
                .into_response(),
        }
    }
}

/// Verifies, normalizes, classifies and routes webhook deliveries.
pub struct Dispatcher {
    profiles: HashMap<ProviderKind, ProviderProfile>,
    queue: Arc<dyn JobQueue>,
    ctx: HandlerContext,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        profiles: Vec<ProviderProfile>,
        queue: Arc<dyn JobQueue>,
        ctx: HandlerContext,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            profiles: profiles.into_iter().map(|p| (p.kind, p)).collect(),
            queue,
            ctx,
            policy,
        }
    }

    pub fn profile(&self, kind: ProviderKind) -> Option<&ProviderProfile> {
        self.profiles.get(&kind)
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run one delivery through the pipeline.
    pub async fn dispatch(
        &self,
        kind: ProviderKind,
        headers: &HeaderMap,
        raw_body: &[u8],
    ) -> Result<Acknowledgement, Rejection> {
        let started = Instant::now();
        let webhook_id = generate_webhook_id(kind);

        let profile = self.profiles.get(&kind).ok_or_else(|| {
            Rejection::new(&webhook_id, DispatchError::UnknownProvider(kind.to_string()))
        })?;

        info!(
            webhook_id = %webhook_id,
            provider = %kind,
            body_length = raw_body.len(),
            "webhook_received"
        );

        let verified = verify_signature(
            raw_body,
            profile.signature(headers),
            profile.secret.as_deref(),
            &profile.signature_format,
        );
        if !verified {
            warn!(
                webhook_id = %webhook_id,
                provider = %kind,
                signature_present = profile.signature(headers).is_some(),
                secret_configured = is_secret_configured(profile.secret.as_deref()),
                elapsed_ms = elapsed_ms(started),
                "webhook_signature_invalid"
            );
            return Err(Rejection::new(webhook_id, DispatchError::SignatureInvalid));
        }

        debug!(
            webhook_id = %webhook_id,
            provider = %kind,
            elapsed_ms = elapsed_ms(started),
            "webhook_verified"
        );

        let raw: Value = serde_json::from_slice(raw_body).map_err(|e| {
            warn!(
                webhook_id = %webhook_id,
                provider = %kind,
                error = %e,
                elapsed_ms = elapsed_ms(started),
                "webhook_invalid_json"
            );
            Rejection::new(&webhook_id, DispatchError::InvalidJson(e))
        })?;

        let origin = headers
            .get(CALENDAR_SOURCE_HEADER)
            .and_then(|v| v.to_str().ok());

        let envelope = self.normalize_logged(kind, &raw, origin, &webhook_id, started)?;

        self.route(profile, envelope, webhook_id, started, profile.queue_enabled)
            .await
    }

    /// Queue an operator-submitted event without signature checks.
    pub async fn submit_manual(
        &self,
        kind: ProviderKind,
        event: &Value,
    ) -> Result<Acknowledgement, Rejection> {
        let started = Instant::now();
        let webhook_id = generate_webhook_id(kind);

        let profile = self.profiles.get(&kind).ok_or_else(|| {
            Rejection::new(&webhook_id, DispatchError::UnknownProvider(kind.to_string()))
        })?;

        info!(webhook_id = %webhook_id, provider = %kind, "webhook_manual_submission");

        let envelope = self.normalize_logged(kind, event, None, &webhook_id, started)?;
        self.route(profile, envelope, webhook_id, started, true).await
    }

    fn normalize_logged(
        &self,
        kind: ProviderKind,
        raw: &Value,
        origin: Option<&str>,
        webhook_id: &str,
        started: Instant,
    ) -> Result<WebhookEnvelope, Rejection> {
        match normalize(kind, raw, origin) {
            Ok(envelope) => {
                info!(
                    webhook_id = %webhook_id,
                    provider = %kind,
                    event_type = %envelope.event_type,
                    event_id = %envelope.id,
                    elapsed_ms = elapsed_ms(started),
                    "webhook_normalized"
                );
                Ok(envelope)
            }
            Err(e) => {
                warn!(
                    webhook_id = %webhook_id,
                    provider = %kind,
                    error = %e,
                    elapsed_ms = elapsed_ms(started),
                    "webhook_malformed_event"
                );
                Err(Rejection::new(webhook_id, DispatchError::MalformedEvent(e)))
            }
        }
    }

    async fn route(
        &self,
        profile: &ProviderProfile,
        envelope: WebhookEnvelope,
        webhook_id: String,
        started: Instant,
        queued: bool,
    ) -> Result<Acknowledgement, Rejection> {
        let classification = classify(&envelope, &profile.table);
        let provider = profile.kind;
        let event_type = envelope.event_type.clone();

        info!(
            webhook_id = %webhook_id,
            provider = %provider,
            event_type = %event_type,
            priority = classification.priority.as_str(),
            route = classification.route.name,
            queued = queued,
            elapsed_ms = elapsed_ms(started),
            "webhook_classified"
        );

        if queued {
            let job = DispatchJob::new(
                envelope,
                webhook_id.clone(),
                classification.priority,
                self.policy.clone(),
            );

            return match self.queue.submit(job).await {
                Ok(handle) => {
                    info!(
                        webhook_id = %webhook_id,
                        provider = %provider,
                        event_type = %event_type,
                        job_id = %handle.job_id,
                        duplicate = handle.duplicate,
                        elapsed_ms = elapsed_ms(started),
                        "webhook_queued"
                    );
                    Ok(Acknowledgement::Accepted {
                        webhook_id,
                        job_id: handle.job_id,
                        duplicate: handle.duplicate,
                    })
                }
                Err(e) => {
                    error!(
                        webhook_id = %webhook_id,
                        provider = %provider,
                        event_type = %event_type,
                        error = %e,
                        elapsed_ms = elapsed_ms(started),
                        "webhook_queue_failed"
                    );
                    Err(Rejection::new(webhook_id, DispatchError::Queue(e))
                        .with_processing_time(started.elapsed()))
                }
            };
        }

        let result = self
            .run_inline(classification.route, Arc::new(envelope), webhook_id.clone())
            .await;
        let processing_time = started.elapsed();

        match result {
            Ok(()) => {
                info!(
                    webhook_id = %webhook_id,
                    provider = %provider,
                    event_type = %event_type,
                    route = classification.route.name,
                    elapsed_ms = elapsed_ms(started),
                    "webhook_processed"
                );
                Ok(Acknowledgement::Processed {
                    webhook_id,
                    processing_time,
                })
            }
            Err(e) => {
                error!(
                    webhook_id = %webhook_id,
                    provider = %provider,
                    event_type = %event_type,
                    route = classification.route.name,
                    error = %e,
                    elapsed_ms = elapsed_ms(started),
                    "webhook_handler_failed"
                );
                Err(Rejection::new(webhook_id, DispatchError::HandlerFailure(e))
                    .with_processing_time(processing_time))
            }
        }
    }

    /// Run a route on its own task so a panic becomes a handler error.
    pub async fn run_inline(
        &self,
        route: Route,
        envelope: Arc<WebhookEnvelope>,
        webhook_id: String,
    ) -> Result<(), HandlerError> {
        let ctx = self.ctx.clone();
        let task = tokio::spawn(async move { route.invoke(ctx, envelope, webhook_id).await });

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(HandlerError::Panicked(panic_message(e.into_panic()))),
            Err(_) => Err(HandlerError::Cancelled),
        }
    }

    /// Classify a queued job against its provider's table.
    pub fn classify_job(&self, job: &DispatchJob) -> Result<Classification, HandlerError> {
        let profile = self.profiles.get(&job.envelope.source).ok_or_else(|| {
            HandlerError::InvalidPayload(format!("no profile for {}", job.envelope.source))
        })?;
        Ok(classify(&job.envelope, &profile.table))
    }

    /// Run the handler for a queued job.
    pub async fn execute_job(&self, job: &DispatchJob) -> Result<(), HandlerError> {
        let classification = self.classify_job(job)?;
        self.run_inline(
            classification.route,
            Arc::new(job.envelope.clone()),
            job.webhook_id.clone(),
        )
        .await
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic");
    }

    #[test]
    fn test_acknowledgement_webhook_id() {
        let ack = Acknowledgement::Processed {
            webhook_id: "hubspot_1_x".into(),
            processing_time: Duration::from_millis(3),
        };
        assert_eq!(ack.webhook_id(), "hubspot_1_x");
    }
}
