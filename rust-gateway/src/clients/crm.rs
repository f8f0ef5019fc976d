//! Pipeline Service (HubSpot CRM) client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::info;

use super::{ApiClient, ClientError};

/// Association type ids defined by HubSpot.
const NOTE_TO_CONTACT: u32 = 202;
const NOTE_TO_DEAL: u32 = 214;
const DEAL_TO_CONTACT: u32 = 3;

/// Contact fields synchronized into the CRM.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContactUpsert {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub conversation_status: Option<String>,
    pub property_interest: Option<String>,
}

/// How to look up an existing contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Email,
    Phone,
}

impl IdentifierKind {
    fn property(&self) -> &'static str {
        match self {
            IdentifierKind::Email => "email",
            IdentifierKind::Phone => "phone",
        }
    }
}

/// A contact as stored in the CRM.
#[derive(Debug, Clone, PartialEq)]
pub struct CrmContact {
    pub id: String,
    pub properties: Map<String, Value>,
}

/// A deal to open for a qualified lead.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DealDraft {
    pub contact_id: Option<String>,
    pub contact_name: String,
    pub property_name: String,
    pub ai_stage: String,
    pub ai_agent: String,
    pub estimated_rent: Option<f64>,
    pub qualification_score: Option<u32>,
    pub conversation_id: Option<String>,
    pub tour_date: Option<String>,
}

/// An AI-agent activity recorded against a contact.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityLog {
    pub contact_id: String,
    pub deal_id: Option<String>,
    pub activity_type: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub conversation_id: Option<String>,
    pub ai_agent: Option<String>,
}

/// Operations handlers need from the CRM.
#[async_trait]
pub trait CrmClient: Send + Sync {
    /// Create or update a contact, returning its CRM id.
    async fn upsert_contact(&self, contact: &ContactUpsert) -> Result<String, ClientError>;

    async fn find_contact(
        &self,
        identifier: &str,
        kind: IdentifierKind,
    ) -> Result<Option<CrmContact>, ClientError>;

    /// Open a deal, returning its CRM id.
    async fn create_deal(&self, deal: &DealDraft) -> Result<String, ClientError>;

    /// Move a deal to the CRM stage matching `ai_stage`.
    async fn update_deal_stage(
        &self,
        deal_id: &str,
        ai_stage: &str,
        ai_agent: &str,
    ) -> Result<(), ClientError>;

    /// Record an activity note, returning its CRM id.
    async fn log_activity(&self, activity: &ActivityLog) -> Result<String, ClientError>;
}

/// Map an AI conversation stage onto a HubSpot deal stage.
pub fn map_ai_stage(ai_stage: &str) -> &'static str {
    match ai_stage {
        "lead" => "qualifiedtobuy",
        "qualified" | "tour_scheduled" => "appointmentscheduled",
        "tour_completed" => "decisionmakerstage",
        "application" => "contractsent",
        "lease_signed" => "closedwon",
        "unqualified" => "closedlost",
        _ => "qualifiedtobuy",
    }
}

/// Render the note body HubSpot shows for an activity.
pub fn format_activity_body(activity: &ActivityLog) -> String {
    [
        format!("AI Agent Activity: {}", activity.activity_type),
        format!("Agent: {}", activity.ai_agent.as_deref().unwrap_or("Maya")),
        format!(
            "Conversation ID: {}",
            activity.conversation_id.as_deref().unwrap_or("n/a")
        ),
        String::new(),
        "Activity Details:".to_string(),
        activity.content.clone(),
        String::new(),
        format!("Timestamp: {}", activity.timestamp.format("%Y-%m-%d %H:%M UTC")),
    ]
    .join("\n")
}

/// HubSpot CRM v3 client.
#[derive(Clone)]
pub struct HubSpotClient {
    api: ApiClient,
}

impl HubSpotClient {
    pub fn new(
        base_url: &str,
        access_token: Option<&str>,
        timeout: Duration,
        max_attempts: u32,
    ) -> Result<Self, ClientError> {
        let authorization = access_token.map(|token| format!("Bearer {}", token));
        Ok(Self {
            api: ApiClient::new("hubspot", base_url, authorization, timeout, max_attempts)?,
        })
    }

    fn contact_properties(contact: &ContactUpsert) -> Map<String, Value> {
        let mut properties = Map::new();
        let fields = [
            ("email", &contact.email),
            ("firstname", &contact.first_name),
            ("lastname", &contact.last_name),
            ("phone", &contact.phone),
            ("ai_conversation_status", &contact.conversation_status),
            ("urbanhub_property_interest", &contact.property_interest),
        ];
        for (name, value) in fields {
            if let Some(value) = value {
                properties.insert(name.to_string(), Value::String(value.clone()));
            }
        }
        properties.insert(
            "ai_agent_last_contact".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        properties.insert(
            "lead_source".to_string(),
            Value::String("Bird.com AI Agent".to_string()),
        );
        properties.insert(
            "preferred_communication".to_string(),
            Value::String("WhatsApp".to_string()),
        );
        properties
    }
}

fn id_of(value: &Value) -> Result<String, ClientError> {
    match value.get("id") {
        Some(Value::String(id)) => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err(ClientError::Decode("response has no id".to_string())),
    }
}

#[async_trait]
impl CrmClient for HubSpotClient {
    async fn upsert_contact(&self, contact: &ContactUpsert) -> Result<String, ClientError> {
        let properties = Value::Object(Self::contact_properties(contact));

        let existing = match (&contact.email, &contact.phone) {
            (Some(email), _) => self.find_contact(email, IdentifierKind::Email).await?,
            (None, Some(phone)) => self.find_contact(phone, IdentifierKind::Phone).await?,
            (None, None) => None,
        };

        match existing {
            Some(found) => {
                self.api
                    .patch(
                        &format!("/crm/v3/objects/contacts/{}", found.id),
                        &json!({ "properties": properties }),
                    )
                    .await?;
                info!(hubspot_contact_id = %found.id, "hubspot_contact_updated");
                Ok(found.id)
            }
            None => {
                let created = self
                    .api
                    .post("/crm/v3/objects/contacts", &json!({ "properties": properties }))
                    .await?;
                let id = id_of(&created)?;
                info!(hubspot_contact_id = %id, "hubspot_contact_created");
                Ok(id)
            }
        }
    }

    async fn find_contact(
        &self,
        identifier: &str,
        kind: IdentifierKind,
    ) -> Result<Option<CrmContact>, ClientError> {
        let request = json!({
            "filterGroups": [{
                "filters": [{
                    "propertyName": kind.property(),
                    "operator": "EQ",
                    "value": identifier
                }]
            }],
            "properties": [
                "email", "firstname", "lastname", "phone",
                "ai_conversation_status", "ai_agent_last_contact",
                "urbanhub_property_interest", "lead_source"
            ],
            "limit": 1
        });

        let response = self
            .api
            .post("/crm/v3/objects/contacts/search", &request)
            .await?;

        let Some(first) = response
            .get("results")
            .and_then(Value::as_array)
            .and_then(|results| results.first())
        else {
            return Ok(None);
        };

        Ok(Some(CrmContact {
            id: id_of(first)?,
            properties: first
                .get("properties")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        }))
    }

    async fn create_deal(&self, deal: &DealDraft) -> Result<String, ClientError> {
        let mut properties = json!({
            "dealname": format!("{} - {}", deal.contact_name, deal.property_name),
            "dealstage": map_ai_stage(&deal.ai_stage),
            "pipeline": "default",
            "source": "Bird.com AI Agent",
            "ai_agent_type": deal.ai_agent,
            "property_name": deal.property_name,
        });
        if let Some(map) = properties.as_object_mut() {
            if let Some(rent) = deal.estimated_rent {
                map.insert("amount".to_string(), json!(rent));
            }
            if let Some(score) = deal.qualification_score {
                map.insert("lead_qualification_score".to_string(), json!(score));
            }
            if let Some(conversation_id) = &deal.conversation_id {
                map.insert("urbanhub_conversation_id".to_string(), json!(conversation_id));
            }
            if let Some(tour_date) = &deal.tour_date {
                map.insert("tour_scheduled_date".to_string(), json!(tour_date));
            }
        }

        let associations: Vec<Value> = deal
            .contact_id
            .iter()
            .map(|contact_id| {
                json!({
                    "to": { "id": contact_id },
                    "types": [{
                        "associationCategory": "HUBSPOT_DEFINED",
                        "associationTypeId": DEAL_TO_CONTACT
                    }]
                })
            })
            .collect();

        let created = self
            .api
            .post(
                "/crm/v3/objects/deals",
                &json!({ "properties": properties, "associations": associations }),
            )
            .await?;
        let id = id_of(&created)?;
        info!(hubspot_deal_id = %id, "hubspot_deal_created");
        Ok(id)
    }

    async fn update_deal_stage(
        &self,
        deal_id: &str,
        ai_stage: &str,
        ai_agent: &str,
    ) -> Result<(), ClientError> {
        let properties = json!({
            "dealstage": map_ai_stage(ai_stage),
            "ai_agent_type": ai_agent,
            "ai_agent_last_update": Utc::now().to_rfc3339(),
        });

        self.api
            .patch(
                &format!("/crm/v3/objects/deals/{}", deal_id),
                &json!({ "properties": properties }),
            )
            .await?;

        info!(
            hubspot_deal_id = %deal_id,
            ai_stage = %ai_stage,
            deal_stage = map_ai_stage(ai_stage),
            "hubspot_deal_stage_updated"
        );
        Ok(())
    }

    async fn log_activity(&self, activity: &ActivityLog) -> Result<String, ClientError> {
        let mut associations = vec![json!({
            "to": { "id": activity.contact_id },
            "types": [{
                "associationCategory": "HUBSPOT_DEFINED",
                "associationTypeId": NOTE_TO_CONTACT
            }]
        })];
        if let Some(deal_id) = &activity.deal_id {
            associations.push(json!({
                "to": { "id": deal_id },
                "types": [{
                    "associationCategory": "HUBSPOT_DEFINED",
                    "associationTypeId": NOTE_TO_DEAL
                }]
            }));
        }

        let note = json!({
            "properties": {
                "hs_timestamp": activity.timestamp.to_rfc3339(),
                "hs_note_body": format_activity_body(activity),
            },
            "associations": associations,
        });

        let created = self.api.post("/crm/v3/objects/notes", &note).await?;
        let id = id_of(&created)?;
        info!(
            hubspot_note_id = %id,
            hubspot_contact_id = %activity.contact_id,
            activity_type = %activity.activity_type,
            "hubspot_activity_logged"
        );
        Ok(id)
    }
}
