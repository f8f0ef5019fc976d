//! Shared fixtures for integration tests: an in-memory job queue and
//! recording fakes for the upstream clients.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{Map, Value};
use tower::ServiceExt;

use leadhook::clients::{
    ActivityLog, Booking, CalendarClient, ClientError, ContactUpsert, CrmClient, CrmContact,
    DealDraft, EscalationPriority, IdentifierKind, MessagingClient, MessagingContact, NewContact,
    ReplyButton,
};
use leadhook::web::{self, sign_payload, SignatureFormat};
use leadhook::{
    AppState, Config, DispatchJob, Dispatcher, HandlerContext, JobHandle, JobQueue, JobRegistry,
    ProviderProfile, QueueError, RetryPolicy,
};

pub const BIRD_SECRET: &str = "bird-test-secret";
pub const HUBSPOT_SECRET: &str = "hubspot-test-secret";
pub const CALENDAR_SECRET: &str = "calendar-test-secret";
pub const WHATSAPP_TOKEN: &str = "wa-verify-token";

// =============================================================================
// Queue
// =============================================================================

/// In-memory [`JobQueue`] that records every accepted job.
pub struct RecordingQueue {
    pub registry: JobRegistry,
    pub dedupe: bool,
    pub submitted: Mutex<Vec<DispatchJob>>,
    pub fail: AtomicBool,
}

impl RecordingQueue {
    pub fn new(dedupe: bool) -> Self {
        Self {
            registry: JobRegistry::default(),
            dedupe,
            submitted: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn jobs(&self) -> Vec<DispatchJob> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobQueue for RecordingQueue {
    async fn submit(&self, job: DispatchJob) -> Result<JobHandle, QueueError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("broker down".to_string()));
        }
        if !self.registry.reserve(&job.job_id, self.dedupe) {
            return Ok(JobHandle {
                job_id: job.job_id,
                duplicate: true,
            });
        }
        let job_id = job.job_id.clone();
        self.submitted.lock().unwrap().push(job);
        Ok(JobHandle {
            job_id,
            duplicate: false,
        })
    }

    async fn status(&self, job_id: &str) -> Result<Option<leadhook::queue::JobRecord>, QueueError> {
        Ok(self.registry.get(job_id))
    }
}

// =============================================================================
// Upstream fakes
// =============================================================================

fn upstream_failure() -> ClientError {
    ClientError::Status {
        status: 503,
        body: "unavailable".to_string(),
    }
}

#[derive(Default)]
pub struct FakeCrm {
    pub calls: Mutex<Vec<String>>,
    pub upserts: Mutex<Vec<ContactUpsert>>,
    pub activities: Mutex<Vec<ActivityLog>>,
    pub fail: AtomicBool,
}

impl FakeCrm {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<(), ClientError> {
        self.calls.lock().unwrap().push(call);
        if self.fail.load(Ordering::SeqCst) {
            Err(upstream_failure())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CrmClient for FakeCrm {
    async fn upsert_contact(&self, contact: &ContactUpsert) -> Result<String, ClientError> {
        self.record(format!("upsert_contact:{}", contact.phone.clone().unwrap_or_default()))?;
        self.upserts.lock().unwrap().push(contact.clone());
        Ok("crm_contact_1".to_string())
    }

    async fn find_contact(
        &self,
        identifier: &str,
        _kind: IdentifierKind,
    ) -> Result<Option<CrmContact>, ClientError> {
        self.record(format!("find_contact:{}", identifier))?;
        Ok(None)
    }

    async fn create_deal(&self, deal: &DealDraft) -> Result<String, ClientError> {
        self.record(format!("create_deal:{}", deal.contact_name))?;
        Ok("crm_deal_1".to_string())
    }

    async fn update_deal_stage(
        &self,
        deal_id: &str,
        ai_stage: &str,
        _ai_agent: &str,
    ) -> Result<(), ClientError> {
        self.record(format!("update_deal_stage:{}:{}", deal_id, ai_stage))
    }

    async fn log_activity(&self, activity: &ActivityLog) -> Result<String, ClientError> {
        self.record(format!(
            "log_activity:{}:{}",
            activity.contact_id, activity.activity_type
        ))?;
        self.activities.lock().unwrap().push(activity.clone());
        Ok("crm_note_1".to_string())
    }
}

#[derive(Default)]
pub struct FakeMessaging {
    pub calls: Mutex<Vec<String>>,
    pub texts: Mutex<Vec<(String, String)>>,
    pub fail: AtomicBool,
    pub panic: AtomicBool,
}

impl FakeMessaging {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<(), ClientError> {
        if self.panic.load(Ordering::SeqCst) {
            panic!("messaging fake exploded");
        }
        self.calls.lock().unwrap().push(call);
        if self.fail.load(Ordering::SeqCst) {
            Err(upstream_failure())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MessagingClient for FakeMessaging {
    async fn send_text(
        &self,
        to: &str,
        text: &str,
        _conversation_id: Option<&str>,
    ) -> Result<String, ClientError> {
        self.record(format!("send_text:{}", to))?;
        self.texts
            .lock()
            .unwrap()
            .push((to.to_string(), text.to_string()));
        Ok("msg_1".to_string())
    }

    async fn send_template(
        &self,
        to: &str,
        template: &str,
        _parameters: &[String],
        _conversation_id: Option<&str>,
    ) -> Result<String, ClientError> {
        self.record(format!("send_template:{}:{}", to, template))?;
        Ok("msg_2".to_string())
    }

    async fn send_interactive(
        &self,
        to: &str,
        _header: &str,
        _body: &str,
        _buttons: &[ReplyButton],
        _conversation_id: Option<&str>,
    ) -> Result<String, ClientError> {
        self.record(format!("send_interactive:{}", to))?;
        Ok("msg_3".to_string())
    }

    async fn find_contact_by_phone(
        &self,
        phone: &str,
    ) -> Result<Option<MessagingContact>, ClientError> {
        self.record(format!("find_contact_by_phone:{}", phone))?;
        Ok(None)
    }

    async fn create_contact(&self, contact: &NewContact) -> Result<String, ClientError> {
        self.record(format!("create_contact:{}", contact.phone))?;
        Ok("bird_contact_1".to_string())
    }

    async fn escalate_conversation(
        &self,
        conversation_id: &str,
        _reason: &str,
        priority: EscalationPriority,
    ) -> Result<(), ClientError> {
        self.record(format!("escalate:{}:{}", conversation_id, priority))
    }
}

/// Calendar fake whose bookings all carry the same invitee phone.
pub struct FakeCalendar {
    pub calls: Mutex<Vec<String>>,
    pub invitee_phone: Option<String>,
    pub fail: AtomicBool,
}

impl Default for FakeCalendar {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            invitee_phone: Some("+525500000000".to_string()),
            fail: AtomicBool::new(false),
        }
    }
}

impl FakeCalendar {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CalendarClient for FakeCalendar {
    async fn get_booking(&self, booking_id: &str) -> Result<Booking, ClientError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("get_booking:{}", booking_id));
        if self.fail.load(Ordering::SeqCst) {
            return Err(upstream_failure());
        }
        Ok(Booking {
            id: booking_id.to_string(),
            status: Some("active".to_string()),
            start_time: None,
            end_time: None,
            invitee_name: None,
            invitee_email: None,
            invitee_phone: self.invitee_phone.clone(),
            extra: Map::new(),
        })
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub config: Config,
    pub queue: Arc<RecordingQueue>,
    pub crm: Arc<FakeCrm>,
    pub messaging: Arc<FakeMessaging>,
    pub calendar: Arc<FakeCalendar>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Harness {
    /// Build a dispatcher with test secrets; `vars` override the defaults.
    pub fn new(vars: &[(&str, &str)]) -> Self {
        let mut env: HashMap<String, String> = [
            ("BIRD_WEBHOOK_SECRET", BIRD_SECRET),
            ("HUBSPOT_WEBHOOK_SECRET", HUBSPOT_SECRET),
            ("CALENDAR_WEBHOOK_SECRET", CALENDAR_SECRET),
            ("WHATSAPP_VERIFY_TOKEN", WHATSAPP_TOKEN),
            ("MANUAL_PROCESSING_ENABLED", "true"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in vars {
            env.insert(k.to_string(), v.to_string());
        }
        let config = Config::from_lookup(|key| env.get(key).cloned());

        let queue = Arc::new(RecordingQueue::new(config.queue_dedupe));
        let crm = Arc::new(FakeCrm::default());
        let messaging = Arc::new(FakeMessaging::default());
        let calendar = Arc::new(FakeCalendar::default());

        let ctx = HandlerContext {
            crm: crm.clone(),
            messaging: messaging.clone(),
            calendar: calendar.clone(),
        };

        let dispatcher = Arc::new(Dispatcher::new(
            ProviderProfile::all_from_config(&config),
            queue.clone(),
            ctx,
            RetryPolicy::from_config(&config),
        ));

        Self {
            config,
            queue,
            crm,
            messaging,
            calendar,
            dispatcher,
        }
    }

    pub fn router(&self) -> Router {
        web::app(AppState::new(self.config.clone(), self.dispatcher.clone()))
    }

    pub fn handler_context(&self) -> HandlerContext {
        HandlerContext {
            crm: self.crm.clone(),
            messaging: self.messaging.clone(),
            calendar: self.calendar.clone(),
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

pub fn bird_signature(body: &[u8]) -> String {
    sign_payload(body, BIRD_SECRET, &SignatureFormat::Prefixed("sha256=".to_string()))
}

pub fn hubspot_signature(body: &[u8]) -> String {
    sign_payload(body, HUBSPOT_SECRET, &SignatureFormat::BareHex)
}

pub fn calendar_signature(body: &[u8]) -> String {
    sign_payload(body, CALENDAR_SECRET, &SignatureFormat::BareHex)
}

pub fn post(uri: &str, headers: &[(&str, &str)], body: Vec<u8>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::from(body)).unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Send one request and return `(status, body)`.
pub async fn send(router: Router, request: Request<Body>) -> (u16, Vec<u8>) {
    let response: Response<Body> = router.oneshot(request).await.unwrap();
    let status = response.status().as_u16();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

pub async fn send_json(router: Router, request: Request<Body>) -> (u16, Value) {
    let (status, body) = send(router, request).await;
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, value)
}
