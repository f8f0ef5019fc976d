//! Handlers shared by every provider.

use std::sync::Arc;

use tracing::{error, info};

use super::{HandlerContext, HandlerFuture};
use crate::normalize::WebhookEnvelope;

/// Acknowledge an event nobody routes.
pub fn handle_default(
    _ctx: HandlerContext,
    envelope: Arc<WebhookEnvelope>,
    webhook_id: String,
) -> HandlerFuture {
    Box::pin(async move {
        info!(
            webhook_id = %webhook_id,
            provider = %envelope.source,
            event_type = %envelope.event_type,
            event_id = %envelope.id,
            "webhook_default_handler"
        );
        Ok(())
    })
}

/// Provider-reported error event.
pub fn handle_error(
    _ctx: HandlerContext,
    envelope: Arc<WebhookEnvelope>,
    webhook_id: String,
) -> HandlerFuture {
    Box::pin(async move {
        let message = envelope
            .payload
            .get("error")
            .or_else(|| envelope.payload.get("message"))
            .map(|v| v.to_string())
            .unwrap_or_default();
        error!(
            webhook_id = %webhook_id,
            provider = %envelope.source,
            event_id = %envelope.id,
            error = %message,
            "webhook_error_event"
        );
        Ok(())
    })
}

/// Connectivity test event.
pub fn handle_test(
    _ctx: HandlerContext,
    envelope: Arc<WebhookEnvelope>,
    webhook_id: String,
) -> HandlerFuture {
    Box::pin(async move {
        info!(
            webhook_id = %webhook_id,
            provider = %envelope.source,
            event_id = %envelope.id,
            "webhook_test_event"
        );
        Ok(())
    })
}
