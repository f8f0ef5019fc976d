//! Leadhook - webhook gateway for the lead-qualification workflow.
//!
//! Ingests webhooks from Bird (messaging), HubSpot (CRM pipeline) and calendar
//! relays, and routes each event to a handler that keeps the CRM and the
//! conversation in sync.
//!
//! ## Architecture
//!
//! ```text
//! Webhooks → Web Server → Dispatcher ─┬→ webhook_jobs → Worker → Handler → CRM / Messaging
//!                                     └→ inline Handler (sync providers)
//! ```

pub mod clients;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod normalize;
pub mod queue;
pub mod util;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use dispatch::{Acknowledgement, Dispatcher, Priority, ProviderProfile};
pub use error::{DispatchError, Rejection};
pub use handlers::{HandlerContext, HandlerError};
pub use normalize::{normalize, NormalizationError, ProviderKind, WebhookEnvelope};
pub use queue::{
    AmqpJobQueue, DispatchJob, JobHandle, JobQueue, JobRegistry, JobStatus, QueueError,
    RetryPolicy, DEAD_LETTER_QUEUE, JOB_QUEUE,
};
pub use web::AppState;
