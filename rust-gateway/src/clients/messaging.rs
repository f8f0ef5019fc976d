//! Messaging provider (Bird) client.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::info;

use super::{ApiClient, ClientError};

/// Footer shown under interactive messages.
const INTERACTIVE_FOOTER: &str = "UrbanHub - Vivir mejor es posible";

/// Template language used for WhatsApp templates.
const TEMPLATE_LANGUAGE: &str = "es_MX";

/// A quick-reply button on an interactive message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyButton {
    pub id: String,
    pub title: String,
}

/// A contact as the messaging provider stores it.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagingContact {
    pub id: String,
    pub attributes: Map<String, Value>,
}

/// Fields for a new messaging contact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewContact {
    pub phone: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationPriority {
    Low,
    Medium,
    High,
}

impl EscalationPriority {
    /// Parse a priority from an event payload, defaulting to medium.
    pub fn from_payload(value: Option<&str>) -> Self {
        match value {
            Some("low") => EscalationPriority::Low,
            Some("high") | Some("urgent") => EscalationPriority::High,
            _ => EscalationPriority::Medium,
        }
    }
}

impl fmt::Display for EscalationPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EscalationPriority::Low => "low",
            EscalationPriority::Medium => "medium",
            EscalationPriority::High => "high",
        };
        f.write_str(s)
    }
}

/// Operations handlers need from the messaging provider.
///
/// Send operations return the provider's message id.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    async fn send_text(
        &self,
        to: &str,
        text: &str,
        conversation_id: Option<&str>,
    ) -> Result<String, ClientError>;

    async fn send_template(
        &self,
        to: &str,
        template: &str,
        parameters: &[String],
        conversation_id: Option<&str>,
    ) -> Result<String, ClientError>;

    async fn send_interactive(
        &self,
        to: &str,
        header: &str,
        body: &str,
        buttons: &[ReplyButton],
        conversation_id: Option<&str>,
    ) -> Result<String, ClientError>;

    async fn find_contact_by_phone(
        &self,
        phone: &str,
    ) -> Result<Option<MessagingContact>, ClientError>;

    /// Create a contact, returning its id.
    async fn create_contact(&self, contact: &NewContact) -> Result<String, ClientError>;

    /// Hand a conversation over to a human agent.
    async fn escalate_conversation(
        &self,
        conversation_id: &str,
        reason: &str,
        priority: EscalationPriority,
    ) -> Result<(), ClientError>;
}

/// Bird workspace API client.
///
/// All messages go out through one WhatsApp channel.
#[derive(Clone)]
pub struct BirdClient {
    api: ApiClient,
    channel_id: String,
}

impl BirdClient {
    /// Without an API key or workspace every call fails with
    /// [`ClientError::NotConfigured`].
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        workspace_id: Option<&str>,
        channel_id: Option<&str>,
        timeout: Duration,
        max_attempts: u32,
    ) -> Result<Self, ClientError> {
        let workspace = workspace_id.unwrap_or_default();
        let authorization = match (api_key, workspace_id) {
            (Some(key), Some(_)) => Some(format!("AccessKey {}", key)),
            _ => None,
        };
        let root = format!("{}/workspaces/{}", base_url.trim_end_matches('/'), workspace);

        Ok(Self {
            api: ApiClient::new("bird", &root, authorization, timeout, max_attempts)?,
            channel_id: channel_id.unwrap_or_default().to_string(),
        })
    }

    async fn send_message(
        &self,
        to: &str,
        body: Value,
        conversation_id: Option<&str>,
    ) -> Result<String, ClientError> {
        if self.channel_id.is_empty() {
            return Err(ClientError::NotConfigured("bird channel"));
        }

        let mut message = json!({
            "receiver": {
                "contacts": [{ "identifierValue": to }]
            },
            "body": body,
        });
        if let (Some(map), Some(conversation_id)) = (message.as_object_mut(), conversation_id) {
            map.insert("conversationId".to_string(), json!(conversation_id));
        }

        let response = self
            .api
            .post(&format!("/channels/{}/messages", self.channel_id), &message)
            .await?;

        let id = response
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Decode("message response has no id".to_string()))?
            .to_string();

        info!(message_id = %id, conversation_id = ?conversation_id, "bird_message_sent");
        Ok(id)
    }
}

#[async_trait]
impl MessagingClient for BirdClient {
    async fn send_text(
        &self,
        to: &str,
        text: &str,
        conversation_id: Option<&str>,
    ) -> Result<String, ClientError> {
        let body = json!({ "type": "text", "text": { "text": text } });
        self.send_message(to, body, conversation_id).await
    }

    async fn send_template(
        &self,
        to: &str,
        template: &str,
        parameters: &[String],
        conversation_id: Option<&str>,
    ) -> Result<String, ClientError> {
        let parameters: Vec<Value> = parameters
            .iter()
            .map(|text| json!({ "type": "text", "text": text }))
            .collect();
        let body = json!({
            "type": "template",
            "template": {
                "name": template,
                "language": { "code": TEMPLATE_LANGUAGE },
                "components": [{ "type": "body", "parameters": parameters }]
            }
        });
        self.send_message(to, body, conversation_id).await
    }

    async fn send_interactive(
        &self,
        to: &str,
        header: &str,
        body: &str,
        buttons: &[ReplyButton],
        conversation_id: Option<&str>,
    ) -> Result<String, ClientError> {
        let buttons: Vec<Value> = buttons
            .iter()
            .map(|button| json!({ "type": "reply", "reply": button }))
            .collect();
        let body = json!({
            "type": "interactive",
            "interactive": {
                "type": "button",
                "header": { "type": "text", "text": header },
                "body": { "text": body },
                "footer": { "text": INTERACTIVE_FOOTER },
                "action": { "buttons": buttons }
            }
        });
        self.send_message(to, body, conversation_id).await
    }

    async fn find_contact_by_phone(
        &self,
        phone: &str,
    ) -> Result<Option<MessagingContact>, ClientError> {
        let response = self
            .api
            .get(
                "/contacts",
                &[("identifier", phone), ("identifierType", "phone")],
            )
            .await?;

        let Some(first) = response
            .get("results")
            .and_then(Value::as_array)
            .and_then(|results| results.first())
        else {
            return Ok(None);
        };

        let id = first
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Decode("contact has no id".to_string()))?;

        Ok(Some(MessagingContact {
            id: id.to_string(),
            attributes: first
                .get("attributes")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        }))
    }

    async fn create_contact(&self, contact: &NewContact) -> Result<String, ClientError> {
        let mut identifiers = vec![json!({
            "key": "phonenumber",
            "value": contact.phone,
        })];
        if let Some(email) = &contact.email {
            identifiers.push(json!({ "key": "emailaddress", "value": email }));
        }

        let mut attributes = Map::new();
        if let Some(first_name) = &contact.first_name {
            attributes.insert("firstName".to_string(), json!(first_name));
        }
        if let Some(last_name) = &contact.last_name {
            attributes.insert("lastName".to_string(), json!(last_name));
        }

        let response = self
            .api
            .post(
                "/contacts",
                &json!({ "identifiers": identifiers, "attributes": attributes }),
            )
            .await?;

        let id = response
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Decode("contact response has no id".to_string()))?
            .to_string();

        info!(bird_contact_id = %id, "bird_contact_created");
        Ok(id)
    }

    async fn escalate_conversation(
        &self,
        conversation_id: &str,
        reason: &str,
        priority: EscalationPriority,
    ) -> Result<(), ClientError> {
        self.api
            .post(
                &format!("/conversations/{}/escalate", conversation_id),
                &json!({
                    "reason": reason,
                    "priority": priority,
                    "timestamp": Utc::now().to_rfc3339(),
                }),
            )
            .await?;

        info!(
            conversation_id = %conversation_id,
            reason = %reason,
            priority = %priority,
            "bird_conversation_escalated"
        );
        Ok(())
    }
}
