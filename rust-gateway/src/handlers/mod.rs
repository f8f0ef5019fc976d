//! Event handlers and per-provider routing tables.
//!
//! A handler is a plain function pointer returning a boxed future, so routing
//! tables are data and can be extended per provider without touching the
//! dispatcher.
//!
//! ## Handler Flow
//!
//! ```text
//! WebhookEnvelope → HandlerTable::resolve(event_type) → Route → handler(ctx, envelope, webhook_id)
//!                            └─ no match → default route (log + ack)
//! ```

pub mod bird;
pub mod calendar;
pub mod generic;
pub mod hubspot;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::clients::{CalendarClient, ClientError, CrmClient, MessagingClient};
use crate::normalize::{ProviderKind, WebhookEnvelope};

/// Route every table falls back to.
pub const DEFAULT_ROUTE: &str = "default";

/// Outbound clients available to handlers.
#[derive(Clone)]
pub struct HandlerContext {
    pub crm: Arc<dyn CrmClient>,
    pub messaging: Arc<dyn MessagingClient>,
    pub calendar: Arc<dyn CalendarClient>,
}

/// Why a handler run failed.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Upstream(#[from] ClientError),

    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("handler was cancelled")]
    Cancelled,
}

impl HandlerError {
    /// Whether running the same job again could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            HandlerError::Upstream(e) => e.is_transient(),
            HandlerError::Cancelled => true,
            HandlerError::InvalidPayload(_) | HandlerError::Panicked(_) => false,
        }
    }

    /// Rate-limit hint forwarded to the worker's backoff.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            HandlerError::Upstream(e) => e.retry_after(),
            _ => None,
        }
    }
}

pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

/// Handler entry point: `(clients, envelope, webhook_id)`.
pub type HandlerFn = fn(HandlerContext, Arc<WebhookEnvelope>, String) -> HandlerFuture;

/// A named handler.
#[derive(Clone, Copy)]
pub struct Route {
    pub name: &'static str,
    handler: HandlerFn,
}

impl Route {
    pub const fn new(name: &'static str, handler: HandlerFn) -> Self {
        Self { name, handler }
    }

    pub fn invoke(
        &self,
        ctx: HandlerContext,
        envelope: Arc<WebhookEnvelope>,
        webhook_id: String,
    ) -> HandlerFuture {
        (self.handler)(ctx, envelope, webhook_id)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Route").field(&self.name).finish()
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Route {}

/// Event type → handler mapping for one provider.
#[derive(Debug, Clone)]
pub struct HandlerTable {
    routes: HashMap<&'static str, Route>,
    fallback: Route,
}

impl HandlerTable {
    /// Table holding only the entries every provider shares.
    pub fn base() -> Self {
        let fallback = Route::new(DEFAULT_ROUTE, generic::handle_default);
        let mut routes = HashMap::new();
        routes.insert(DEFAULT_ROUTE, fallback);
        routes.insert("error", Route::new("error", generic::handle_error));
        routes.insert("test", Route::new("test", generic::handle_test));
        Self { routes, fallback }
    }

    /// Add or replace the handler for `event_type`.
    pub fn with_route(mut self, event_type: &'static str, handler: HandlerFn) -> Self {
        self.routes.insert(event_type, Route::new(event_type, handler));
        self
    }

    /// Exact-match lookup; `None` means the event is unroutable.
    pub fn resolve(&self, event_type: &str) -> Option<&Route> {
        self.routes.get(event_type)
    }

    pub fn fallback(&self) -> &Route {
        &self.fallback
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.routes.contains_key(event_type)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// The built-in table for a provider.
pub fn table_for(kind: ProviderKind) -> HandlerTable {
    match kind {
        ProviderKind::Messaging => bird::table(),
        ProviderKind::Pipeline => hubspot::table(),
        ProviderKind::Calendar => calendar::table(),
    }
}

/// Follow `path` through nested objects.
pub(crate) fn value_at<'a>(payload: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    rest.iter()
        .try_fold(payload.get(*first)?, |value, key| value.get(*key))
}

/// Non-empty string at `path`.
pub(crate) fn str_at<'a>(payload: &'a Map<String, Value>, path: &[&str]) -> Option<&'a str> {
    value_at(payload, path)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Identifier at `path`, accepting strings and numbers.
pub(crate) fn id_at(payload: &Map<String, Value>, path: &[&str]) -> Option<String> {
    match value_at(payload, path)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Object at `path`.
pub(crate) fn object_at<'a>(
    payload: &'a Map<String, Value>,
    path: &[&str],
) -> Option<&'a Map<String, Value>> {
    value_at(payload, path).and_then(Value::as_object)
}
