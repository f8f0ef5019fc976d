//! Dispatch errors and their HTTP mapping.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::handlers::HandlerError;
use crate::normalize::NormalizationError;
use crate::queue::QueueError;

/// Why a delivery was rejected.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid webhook signature")]
    SignatureInvalid,

    #[error("malformed event: {0}")]
    MalformedEvent(#[from] NormalizationError),

    #[error("request body is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("unknown webhook provider `{0}`")]
    UnknownProvider(String),

    #[error("handler failed: {0}")]
    HandlerFailure(#[from] HandlerError),

    #[error("job submission failed: {0}")]
    Queue(#[from] QueueError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::SignatureInvalid => StatusCode::UNAUTHORIZED,
            DispatchError::MalformedEvent(_) | DispatchError::InvalidJson(_) => {
                StatusCode::BAD_REQUEST
            }
            DispatchError::UnknownProvider(_) => StatusCode::NOT_FOUND,
            DispatchError::HandlerFailure(_)
            | DispatchError::Queue(_)
            | DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to the caller. Server-side details stay in logs.
    pub fn public_message(&self) -> String {
        match self {
            DispatchError::SignatureInvalid => "Invalid signature".to_string(),
            DispatchError::MalformedEvent(e) => format!("Malformed event: {}", e),
            DispatchError::InvalidJson(_) => "Request body is not valid JSON".to_string(),
            DispatchError::UnknownProvider(provider) => {
                format!("Unknown webhook provider: {}", provider)
            }
            DispatchError::HandlerFailure(_)
            | DispatchError::Queue(_)
            | DispatchError::Internal(_) => "Internal server error".to_string(),
        }
    }
}

/// A rejected delivery, carrying what the response body needs.
#[derive(Debug)]
pub struct Rejection {
    pub webhook_id: Option<String>,
    pub error: DispatchError,
    /// Set once dispatch reached the handler or queue stage
    pub processing_time: Option<Duration>,
}

impl Rejection {
    pub fn new(webhook_id: impl Into<String>, error: DispatchError) -> Self {
        Self {
            webhook_id: Some(webhook_id.into()),
            error,
            processing_time: None,
        }
    }

    /// A rejection that happened before any webhook id was assigned.
    pub fn bare(error: DispatchError) -> Self {
        Self {
            webhook_id: None,
            error,
            processing_time: None,
        }
    }

    pub fn with_processing_time(mut self, elapsed: Duration) -> Self {
        self.processing_time = Some(elapsed);
        self
    }

    pub fn body(&self) -> Value {
        let mut body = json!({ "error": self.error.public_message() });
        if let Some(map) = body.as_object_mut() {
            if let Some(webhook_id) = &self.webhook_id {
                map.insert("webhookId".to_string(), json!(webhook_id));
            }
            if let Some(elapsed) = self.processing_time {
                map.insert("processingTime".to_string(), json!(elapsed.as_millis() as u64));
            }
        }
        body
    }
}

impl From<DispatchError> for Rejection {
    fn from(error: DispatchError) -> Self {
        Rejection::bare(error)
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.error.status_code(), Json(self.body())).into_response()
    }
}
