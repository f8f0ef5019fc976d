//! Messaging (Bird) event handlers.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{
    id_at, object_at, str_at, HandlerContext, HandlerError, HandlerFuture, HandlerTable,
};
use crate::clients::{ActivityLog, ContactUpsert, EscalationPriority, NewContact};
use crate::normalize::WebhookEnvelope;

/// Sent to a lead when one of our outbound messages bounced.
pub const RECOVERY_MESSAGE: &str = "Hola, soy Maya de UrbanHub. Tuve un pequeño problema técnico, \
pero ya estoy aquí para ayudarte. ¿En qué te puedo asistir? 😊";

/// Placeholder name for contacts created from an unknown sender.
const NEW_CONTACT_FIRST_NAME: &str = "Prospecto";
const NEW_CONTACT_LAST_NAME: &str = "Nuevo";

/// Agent name recorded when the event does not say.
const DEFAULT_AGENT: &str = "maya";

pub fn table() -> HandlerTable {
    HandlerTable::base()
        .with_route("conversation.started", handle_conversation_started)
        .with_route("message.received", handle_message_received)
        .with_route("conversation.ended", handle_conversation_ended)
        .with_route("agent.escalation_triggered", handle_escalation_triggered)
        .with_route("message.failed", handle_message_failed)
}

/// Split a display name into first and last name.
pub fn split_name(name: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(name) = name else {
        return (None, None);
    };
    let mut parts = name.split_whitespace();
    let first = parts.next().map(str::to_string);
    let rest: Vec<&str> = parts.collect();
    let last = if rest.is_empty() {
        None
    } else {
        Some(rest.join(" "))
    };
    (first, last)
}

fn agent_name(envelope: &WebhookEnvelope) -> String {
    str_at(&envelope.payload, &["agent", "type"])
        .or_else(|| str_at(&envelope.payload, &["agent", "name"]))
        .unwrap_or(DEFAULT_AGENT)
        .to_string()
}

/// Sync the conversation's contact into the CRM.
pub fn handle_conversation_started(
    ctx: HandlerContext,
    envelope: Arc<WebhookEnvelope>,
    webhook_id: String,
) -> HandlerFuture {
    Box::pin(async move {
        let payload = &envelope.payload;
        let Some(contact) = object_at(payload, &["contact"]) else {
            debug!(webhook_id = %webhook_id, "bird_conversation_without_contact");
            return Ok(());
        };

        let (first_name, last_name) = split_name(str_at(contact, &["name"]));
        let upsert = ContactUpsert {
            email: str_at(contact, &["email"]).map(str::to_string),
            first_name,
            last_name,
            phone: str_at(contact, &["msisdn"])
                .or_else(|| str_at(contact, &["phone"]))
                .map(str::to_string),
            conversation_status: str_at(payload, &["conversation", "status"]).map(str::to_string),
            property_interest: str_at(contact, &["attributes", "propertyInterest"])
                .map(str::to_string),
        };

        if upsert.email.is_none() && upsert.phone.is_none() {
            return Err(HandlerError::InvalidPayload(
                "contact has neither email nor msisdn".to_string(),
            ));
        }

        let crm_id = ctx.crm.upsert_contact(&upsert).await?;
        info!(
            webhook_id = %webhook_id,
            bird_contact_id = ?id_at(contact, &["id"]),
            hubspot_contact_id = %crm_id,
            "bird_contact_synced"
        );
        Ok(())
    })
}

/// Contact id for an inbound message: the CRM id, then the Bird id, then a
/// Bird contact found or created by the sender's phone.
async fn resolve_message_contact(
    ctx: &HandlerContext,
    payload: &serde_json::Map<String, serde_json::Value>,
    webhook_id: &str,
) -> Result<String, HandlerError> {
    if let Some(id) = id_at(payload, &["contact", "hubspot_id"])
        .or_else(|| id_at(payload, &["contact", "id"]))
    {
        return Ok(id);
    }

    let phone = str_at(payload, &["message", "from"])
        .or_else(|| str_at(payload, &["contact", "msisdn"]))
        .ok_or_else(|| HandlerError::InvalidPayload("message has no contact".to_string()))?;

    if let Some(existing) = ctx.messaging.find_contact_by_phone(phone).await? {
        return Ok(existing.id);
    }

    let id = ctx
        .messaging
        .create_contact(&NewContact {
            phone: phone.to_string(),
            email: None,
            first_name: Some(NEW_CONTACT_FIRST_NAME.to_string()),
            last_name: Some(NEW_CONTACT_LAST_NAME.to_string()),
        })
        .await?;
    info!(webhook_id = %webhook_id, bird_contact_id = %id, "bird_contact_created_for_sender");
    Ok(id)
}

/// Record an inbound message as CRM activity.
pub fn handle_message_received(
    ctx: HandlerContext,
    envelope: Arc<WebhookEnvelope>,
    webhook_id: String,
) -> HandlerFuture {
    Box::pin(async move {
        let payload = &envelope.payload;
        let Some(message) = object_at(payload, &["message"]) else {
            debug!(webhook_id = %webhook_id, "bird_message_without_body");
            return Ok(());
        };

        let contact_id = resolve_message_contact(&ctx, payload, &webhook_id).await?;

        let content = str_at(message, &["content", "text"])
            .map(str::to_string)
            .or_else(|| str_at(message, &["content", "type"]).map(|kind| format!("[{}]", kind)))
            .unwrap_or_default();

        let activity = ActivityLog {
            contact_id,
            deal_id: id_at(payload, &["deal_id"]),
            activity_type: "ai_conversation".to_string(),
            content,
            timestamp: envelope.timestamp,
            conversation_id: id_at(payload, &["conversation", "id"]),
            ai_agent: str_at(payload, &["agent", "name"]).map(str::to_string),
        };

        let note_id = ctx.crm.log_activity(&activity).await?;
        info!(
            webhook_id = %webhook_id,
            hubspot_contact_id = %activity.contact_id,
            hubspot_note_id = %note_id,
            "bird_message_logged"
        );
        Ok(())
    })
}

/// Move the deal to the stage the conversation ended in.
pub fn handle_conversation_ended(
    ctx: HandlerContext,
    envelope: Arc<WebhookEnvelope>,
    webhook_id: String,
) -> HandlerFuture {
    Box::pin(async move {
        let payload = &envelope.payload;
        let outcome = str_at(payload, &["conversation", "outcome"]);
        let deal_id =
            id_at(payload, &["deal_id"]).or_else(|| id_at(payload, &["conversation", "deal_id"]));

        let (Some(outcome), Some(deal_id)) = (outcome, deal_id) else {
            debug!(webhook_id = %webhook_id, "bird_conversation_ended_without_outcome");
            return Ok(());
        };

        ctx.crm
            .update_deal_stage(&deal_id, outcome, &agent_name(&envelope))
            .await?;
        info!(
            webhook_id = %webhook_id,
            hubspot_deal_id = %deal_id,
            outcome = %outcome,
            "bird_conversation_outcome_recorded"
        );
        Ok(())
    })
}

/// Hand the conversation to a human.
pub fn handle_escalation_triggered(
    ctx: HandlerContext,
    envelope: Arc<WebhookEnvelope>,
    webhook_id: String,
) -> HandlerFuture {
    Box::pin(async move {
        let payload = &envelope.payload;
        let conversation_id = id_at(payload, &["conversation", "id"]).ok_or_else(|| {
            HandlerError::InvalidPayload("escalation without conversation id".to_string())
        })?;
        let reason = str_at(payload, &["escalation", "reason"]).unwrap_or("agent escalation");
        let priority =
            EscalationPriority::from_payload(str_at(payload, &["escalation", "priority"]));

        ctx.messaging
            .escalate_conversation(&conversation_id, reason, priority)
            .await?;
        warn!(
            webhook_id = %webhook_id,
            conversation_id = %conversation_id,
            reason = %reason,
            priority = %priority,
            "bird_conversation_escalated"
        );
        Ok(())
    })
}

/// Retry a failed outbound message with a plain recovery text.
pub fn handle_message_failed(
    ctx: HandlerContext,
    envelope: Arc<WebhookEnvelope>,
    webhook_id: String,
) -> HandlerFuture {
    Box::pin(async move {
        let payload = &envelope.payload;
        let to = str_at(payload, &["to"])
            .or_else(|| str_at(payload, &["message", "to"]))
            .or_else(|| str_at(payload, &["data", "to"]))
            .ok_or_else(|| {
                HandlerError::InvalidPayload("failed message has no recipient".to_string())
            })?;

        warn!(
            webhook_id = %webhook_id,
            failed_message_id = ?id_at(payload, &["message", "id"]),
            reason = ?str_at(payload, &["error", "message"]),
            "bird_message_failed"
        );

        let message_id = ctx
            .messaging
            .send_text(to, RECOVERY_MESSAGE, None)
            .await?;
        info!(webhook_id = %webhook_id, message_id = %message_id, "bird_message_recovery_sent");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_name() {
        assert_eq!(
            split_name(Some("Ana María López")),
            (Some("Ana".to_string()), Some("María López".to_string()))
        );
        assert_eq!(split_name(Some("Ana")), (Some("Ana".to_string()), None));
        assert_eq!(split_name(Some("   ")), (None, None));
        assert_eq!(split_name(None), (None, None));
    }
}
