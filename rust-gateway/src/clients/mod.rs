//! Outbound API clients.
//!
//! Handlers talk to the CRM, the messaging provider and the calendar provider
//! only through the traits defined here, so tests can swap in fakes.

pub mod calendar;
pub mod crm;
pub mod http;
pub mod messaging;

use std::time::Duration;

use thiserror::Error;

pub use calendar::{Booking, CalendarClient, HttpCalendarClient};
pub use crm::{
    map_ai_stage, ActivityLog, ContactUpsert, CrmClient, CrmContact, DealDraft, HubSpotClient,
    IdentifierKind,
};
pub use http::ApiClient;
pub use messaging::{
    BirdClient, EscalationPriority, MessagingClient, MessagingContact, NewContact, ReplyButton,
};

/// Failure of a single upstream call.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("could not decode upstream response: {0}")]
    Decode(String),

    #[error("{0} client is not configured")]
    NotConfigured(&'static str),
}

impl ClientError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Timeout(_)
            | ClientError::RateLimited { .. }
            | ClientError::Transport(_) => true,
            ClientError::Status { status, .. } => *status >= 500,
            ClientError::Decode(_) | ClientError::NotConfigured(_) => false,
        }
    }

    /// Provider-supplied delay hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClientError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
