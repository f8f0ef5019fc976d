//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - Job and status types for the `webhook_jobs` priority queue
//! - The [`JobQueue`] seam the dispatcher submits through
//! - An AMQP implementation with deterministic-id dedup
//!
//! ## Architecture
//!
//! ```text
//! Dispatcher → JobQueue::submit → webhook_jobs queue → Worker → handler
//!                                                         └─ exhausted → webhook_jobs.dead
//! ```

pub mod publisher;
pub mod registry;
pub mod types;

use async_trait::async_trait;
use thiserror::Error;

pub use publisher::AmqpJobQueue;
pub use registry::JobRegistry;
pub use types::{
    Backoff, BackoffKind, DeadLetter, DispatchJob, JobHandle, JobRecord, JobStatus, RetryPolicy,
    DEAD_LETTER_QUEUE, JOB_QUEUE, MAX_PRIORITY,
};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("could not encode job: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where the dispatcher hands off queued work.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job. With dedup on, an already accepted job id returns the
    /// existing handle marked as a duplicate.
    async fn submit(&self, job: DispatchJob) -> Result<JobHandle, QueueError>;

    async fn status(&self, job_id: &str) -> Result<Option<JobRecord>, QueueError>;
}
