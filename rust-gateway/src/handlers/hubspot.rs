//! Pipeline (HubSpot) event handlers. CRM changes are only recorded here.

use std::sync::Arc;

use tracing::info;

use super::{id_at, str_at, HandlerContext, HandlerFuture, HandlerTable};
use crate::normalize::WebhookEnvelope;

pub fn table() -> HandlerTable {
    HandlerTable::base()
        .with_route("contact.propertyChange", handle_contact_property_change)
        .with_route("deal.propertyChange", handle_deal_property_change)
        .with_route("contact.creation", handle_contact_creation)
}

pub fn handle_contact_property_change(
    _ctx: HandlerContext,
    envelope: Arc<WebhookEnvelope>,
    webhook_id: String,
) -> HandlerFuture {
    Box::pin(async move {
        let payload = &envelope.payload;
        info!(
            webhook_id = %webhook_id,
            hubspot_contact_id = ?id_at(payload, &["objectId"]),
            property_name = ?str_at(payload, &["propertyName"]),
            property_value = ?payload.get("propertyValue"),
            change_source = ?str_at(payload, &["changeSource"]),
            "hubspot_contact_property_changed"
        );
        Ok(())
    })
}

pub fn handle_deal_property_change(
    _ctx: HandlerContext,
    envelope: Arc<WebhookEnvelope>,
    webhook_id: String,
) -> HandlerFuture {
    Box::pin(async move {
        let payload = &envelope.payload;
        info!(
            webhook_id = %webhook_id,
            hubspot_deal_id = ?id_at(payload, &["objectId"]),
            property_name = ?str_at(payload, &["propertyName"]),
            property_value = ?payload.get("propertyValue"),
            "hubspot_deal_property_changed"
        );
        Ok(())
    })
}

pub fn handle_contact_creation(
    _ctx: HandlerContext,
    envelope: Arc<WebhookEnvelope>,
    webhook_id: String,
) -> HandlerFuture {
    Box::pin(async move {
        info!(
            webhook_id = %webhook_id,
            hubspot_contact_id = ?id_at(&envelope.payload, &["objectId"]),
            portal_id = ?id_at(&envelope.payload, &["portalId"]),
            "hubspot_contact_created_event"
        );
        Ok(())
    })
}
