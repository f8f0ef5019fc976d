//! Queue message types and retry policy.
//!
//! This module defines:
//! - `webhook_jobs` queue: [`DispatchJob`]s waiting for a handler
//! - `webhook_jobs.dead` queue: [`DeadLetter`]s that exhausted their policy

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::dispatch::Priority;
use crate::normalize::WebhookEnvelope;
use crate::util::ids::job_id_for;

/// Queue name for dispatch jobs.
pub const JOB_QUEUE: &str = "webhook_jobs";

/// Queue name for jobs that exhausted their retry policy.
pub const DEAD_LETTER_QUEUE: &str = "webhook_jobs.dead";

/// Declared `x-max-priority` of the job queue.
pub const MAX_PRIORITY: u8 = 10;

// =============================================================================
// Retry policy
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Exponential,
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    pub initial_delay_ms: u64,
    pub multiplier: u32,
}

/// Retry policy carried on every job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff {
                kind: BackoffKind::Exponential,
                initial_delay_ms: 2000,
                multiplier: 2,
            },
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        let default = Self::default();
        Self {
            max_attempts: config.retry_attempts.max(1),
            backoff: Backoff {
                initial_delay_ms: config.retry_initial_delay_ms,
                ..default.backoff
            },
            max_delay_ms: config.retry_max_delay_ms,
        }
    }

    /// Whether a job whose zero-based `attempt` just failed gets another try.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }

    /// Delay before retrying after zero-based `attempt` failed.
    ///
    /// `initial * multiplier^attempt`, raised to a provider `retry_after` hint
    /// when one is given, and capped at `max_delay_ms` either way.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let factor = u64::from(self.backoff.multiplier).saturating_pow(attempt);
        let computed = Duration::from_millis(self.backoff.initial_delay_ms.saturating_mul(factor));
        let delay = match retry_after {
            Some(hint) => computed.max(hint),
            None => computed,
        };
        delay.min(Duration::from_millis(self.max_delay_ms))
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// One envelope waiting for its handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchJob {
    /// Deterministic per provider and event id
    pub job_id: String,
    /// Correlation id of the delivery that produced this job
    pub webhook_id: String,
    pub envelope: WebhookEnvelope,
    pub priority: Priority,
    pub policy: RetryPolicy,
    /// Zero-based attempt counter
    #[serde(default)]
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl DispatchJob {
    pub fn new(
        envelope: WebhookEnvelope,
        webhook_id: String,
        priority: Priority,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            job_id: job_id_for(&envelope),
            webhook_id,
            envelope,
            priority,
            policy,
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// The same job, scheduled for its next attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            enqueued_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// Body published to the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job: DispatchJob,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// What a submission returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: String,
    /// True when dedup matched an already accepted job
    pub duplicate: bool,
}

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Active,
    Retrying { attempt: u32 },
    Completed,
    DeadLettered { reason: String },
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Retrying { .. } => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::DeadLettered { .. } => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLettered { .. })
    }
}

/// A status and when it was last set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub status: JobStatus,
    pub updated_at: DateTime<Utc>,
}
