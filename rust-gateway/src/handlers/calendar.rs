//! Calendar (tour booking) event handlers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{id_at, str_at, HandlerContext, HandlerError, HandlerFuture, HandlerTable};
use crate::clients::{ActivityLog, ClientError};
use crate::normalize::WebhookEnvelope;

/// Agent recorded on stage changes made by the scheduler.
const SCHEDULER_AGENT: &str = "scheduler";

pub fn table() -> HandlerTable {
    HandlerTable::base()
        .with_route("booking.created", handle_booking_created)
        .with_route("booking.cancelled", handle_booking_cancelled)
        .with_route("booking.rescheduled", handle_booking_rescheduled)
        .with_route("booking.completed", handle_booking_completed)
}

/// Text sent to the invitee once a tour is booked.
pub fn confirmation_message(name: Option<&str>, start_time: Option<&str>) -> String {
    let greeting = match name {
        Some(name) => format!("¡Hola {}!", name),
        None => "¡Hola!".to_string(),
    };
    let when = start_time
        .map(|raw| match DateTime::parse_from_rfc3339(raw) {
            Ok(dt) => dt.with_timezone(&Utc).format("%d/%m/%Y %H:%M UTC").to_string(),
            Err(_) => raw.to_string(),
        })
        .map(|when| format!(" para el {}", when))
        .unwrap_or_default();

    format!(
        "{} Tu visita con UrbanHub quedó agendada{}. Te esperamos.",
        greeting, when
    )
}

fn contact_id(envelope: &WebhookEnvelope) -> Option<String> {
    let payload = &envelope.payload;
    id_at(payload, &["contact_id"])
        .or_else(|| id_at(payload, &["hubspot_contact_id"]))
        .or_else(|| id_at(payload, &["invitee", "hubspot_id"]))
}

fn deal_id(envelope: &WebhookEnvelope) -> Option<String> {
    id_at(&envelope.payload, &["deal_id"])
        .or_else(|| id_at(&envelope.payload, &["hubspot_deal_id"]))
}

/// Invitee phone from the payload, falling back to a booking lookup for
/// relays that only send the booking id. An unconfigured calendar API means
/// no phone.
async fn invitee_phone(
    ctx: &HandlerContext,
    envelope: &WebhookEnvelope,
    webhook_id: &str,
) -> Result<Option<String>, HandlerError> {
    let payload = &envelope.payload;
    if let Some(phone) =
        str_at(payload, &["invitee", "phone"]).or_else(|| str_at(payload, &["invitee_phone"]))
    {
        return Ok(Some(phone.to_string()));
    }

    let Some(booking_id) = id_at(payload, &["id"]) else {
        return Ok(None);
    };

    match ctx.calendar.get_booking(&booking_id).await {
        Ok(booking) => Ok(booking.invitee_phone),
        Err(ClientError::NotConfigured(service)) => {
            debug!(
                webhook_id = %webhook_id,
                booking_id = %booking_id,
                service = service,
                "calendar_lookup_not_configured"
            );
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Log the tour against the contact and confirm it to the invitee.
/// The phone lookup runs before the CRM note is written.
pub fn handle_booking_created(
    ctx: HandlerContext,
    envelope: Arc<WebhookEnvelope>,
    webhook_id: String,
) -> HandlerFuture {
    Box::pin(async move {
        let payload = &envelope.payload;
        let start_time = str_at(payload, &["start_time"]);
        let phone = invitee_phone(&ctx, &envelope, &webhook_id).await?;

        if let Some(contact_id) = contact_id(&envelope) {
            let activity = ActivityLog {
                contact_id,
                deal_id: deal_id(&envelope),
                activity_type: "tour_scheduled".to_string(),
                content: format!(
                    "Tour scheduled via {} for {}",
                    envelope.origin.as_deref().unwrap_or("calendar"),
                    start_time.unwrap_or("an unspecified time")
                ),
                timestamp: envelope.timestamp,
                conversation_id: id_at(payload, &["conversation_id"]),
                ai_agent: Some(SCHEDULER_AGENT.to_string()),
            };
            let note_id = ctx.crm.log_activity(&activity).await?;
            info!(
                webhook_id = %webhook_id,
                hubspot_contact_id = %activity.contact_id,
                hubspot_note_id = %note_id,
                "calendar_tour_logged"
            );
        }

        let Some(phone) = phone else {
            debug!(webhook_id = %webhook_id, "calendar_booking_without_phone");
            return Ok(());
        };

        let name = str_at(payload, &["invitee", "name"]);
        let text = confirmation_message(name, start_time);
        let message_id = ctx.messaging.send_text(&phone, &text, None).await?;
        info!(
            webhook_id = %webhook_id,
            message_id = %message_id,
            "calendar_confirmation_sent"
        );
        Ok(())
    })
}

async fn move_deal(
    ctx: &HandlerContext,
    envelope: &WebhookEnvelope,
    webhook_id: &str,
    ai_stage: &str,
) -> Result<(), HandlerError> {
    let Some(deal_id) = deal_id(envelope) else {
        debug!(
            webhook_id = %webhook_id,
            event_type = %envelope.event_type,
            "calendar_booking_without_deal"
        );
        return Ok(());
    };

    ctx.crm
        .update_deal_stage(&deal_id, ai_stage, SCHEDULER_AGENT)
        .await?;
    info!(
        webhook_id = %webhook_id,
        hubspot_deal_id = %deal_id,
        ai_stage = %ai_stage,
        "calendar_deal_stage_moved"
    );
    Ok(())
}

/// A cancelled tour sends the deal back to `qualified`.
pub fn handle_booking_cancelled(
    ctx: HandlerContext,
    envelope: Arc<WebhookEnvelope>,
    webhook_id: String,
) -> HandlerFuture {
    Box::pin(async move { move_deal(&ctx, &envelope, &webhook_id, "qualified").await })
}

pub fn handle_booking_rescheduled(
    _ctx: HandlerContext,
    envelope: Arc<WebhookEnvelope>,
    webhook_id: String,
) -> HandlerFuture {
    Box::pin(async move {
        info!(
            webhook_id = %webhook_id,
            booking_id = ?id_at(&envelope.payload, &["id"]),
            start_time = ?str_at(&envelope.payload, &["start_time"]),
            "calendar_booking_rescheduled"
        );
        Ok(())
    })
}

pub fn handle_booking_completed(
    ctx: HandlerContext,
    envelope: Arc<WebhookEnvelope>,
    webhook_id: String,
) -> HandlerFuture {
    Box::pin(async move { move_deal(&ctx, &envelope, &webhook_id, "tour_completed").await })
}
