//! Async RabbitMQ job queue.
//!
//! The queue maintains a persistent connection and channel shared across
//! request tasks, reconnecting on failure, and records every accepted job in
//! a [`JobRegistry`] for dedup and status lookups.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::registry::JobRegistry;
use super::types::{
    DeadLetter, DispatchJob, JobHandle, JobRecord, DEAD_LETTER_QUEUE, JOB_QUEUE, MAX_PRIORITY,
};
use super::{JobQueue, QueueError};

/// Declare arguments for the job queue. Publisher and worker must agree.
pub fn job_queue_arguments() -> FieldTable {
    let mut args = FieldTable::default();
    args.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(MAX_PRIORITY));
    args
}

/// Declare the job and dead-letter queues (idempotent).
pub async fn declare_queues(channel: &Channel) -> Result<()> {
    channel
        .queue_declare(
            JOB_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            job_queue_arguments(),
        )
        .await
        .context("Failed to declare job queue")?;

    channel
        .queue_declare(
            DEAD_LETTER_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("Failed to declare dead-letter queue")?;

    info!(
        job_queue = JOB_QUEUE,
        dead_letter_queue = DEAD_LETTER_QUEUE,
        max_priority = MAX_PRIORITY,
        "rabbitmq_queues_declared"
    );

    Ok(())
}

/// RabbitMQ-backed [`JobQueue`].
#[derive(Clone)]
pub struct AmqpJobQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    url: String,
    dedupe: bool,
    registry: Arc<JobRegistry>,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
}

impl AmqpJobQueue {
    /// Create a queue client for `url`. Connection happens on first publish.
    pub fn new(url: String, registry: Arc<JobRegistry>, dedupe: bool) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                url,
                dedupe,
                registry,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.inner.registry
    }

    /// Ensure we have a valid connection and channel.
    async fn ensure_connected(&self) -> Result<Channel> {
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!("rabbitmq_publisher_connecting");

        let conn = Connection::connect(&self.inner.url, ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;

        info!("rabbitmq_publisher_connected");

        let ch = conn
            .create_channel()
            .await
            .context("Failed to create channel")?;

        declare_queues(&ch).await?;

        *connection = Some(conn);
        *channel = Some(ch.clone());

        Ok(ch)
    }

    /// Publish a job to `webhook_jobs` with its AMQP priority.
    pub async fn publish_job(&self, job: &DispatchJob) -> Result<()> {
        let channel = self.ensure_connected().await?;

        let body = serde_json::to_vec(job).context("Failed to serialize job")?;

        channel
            .basic_publish(
                "",
                JOB_QUEUE,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into())
                    .with_priority(job.priority.amqp_priority())
                    .with_message_id(job.job_id.clone().into()),
            )
            .await
            .context("Failed to publish to job queue")?
            .await
            .context("Failed to confirm publish")?;

        info!(
            queue = JOB_QUEUE,
            job_id = %job.job_id,
            webhook_id = %job.webhook_id,
            priority = job.priority.as_str(),
            attempt = job.attempt,
            body_length = body.len(),
            "rabbitmq_job_published"
        );

        Ok(())
    }

    /// Publish a failed job to `webhook_jobs.dead`.
    pub async fn publish_dead_letter(&self, dead: &DeadLetter) -> Result<()> {
        let channel = self.ensure_connected().await?;

        let body = serde_json::to_vec(dead).context("Failed to serialize dead letter")?;

        channel
            .basic_publish(
                "",
                DEAD_LETTER_QUEUE,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into())
                    .with_message_id(dead.job.job_id.clone().into()),
            )
            .await
            .context("Failed to publish to dead-letter queue")?
            .await
            .context("Failed to confirm publish")?;

        info!(
            queue = DEAD_LETTER_QUEUE,
            job_id = %dead.job.job_id,
            "rabbitmq_dead_letter_published"
        );

        Ok(())
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_publisher_closed");
    }
}

#[async_trait]
impl JobQueue for AmqpJobQueue {
    async fn submit(&self, job: DispatchJob) -> Result<JobHandle, QueueError> {
        let registry = &self.inner.registry;

        if !registry.reserve(&job.job_id, self.inner.dedupe) {
            info!(job_id = %job.job_id, webhook_id = %job.webhook_id, "queue_duplicate_job");
            return Ok(JobHandle {
                job_id: job.job_id,
                duplicate: true,
            });
        }

        if let Err(e) = self.publish_job(&job).await {
            // Let a provider redelivery try again.
            registry.release(&job.job_id);
            return Err(QueueError::Unavailable(format!("{:#}", e)));
        }

        Ok(JobHandle {
            job_id: job.job_id,
            duplicate: false,
        })
    }

    async fn status(&self, job_id: &str) -> Result<Option<JobRecord>, QueueError> {
        Ok(self.inner.registry.get(job_id))
    }
}
