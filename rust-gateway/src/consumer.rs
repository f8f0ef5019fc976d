//! RabbitMQ job worker using lapin.
//!
//! This module consumes [`DispatchJob`]s from the `webhook_jobs` queue and
//! spawns a task per delivery that runs the job's handler. Failed jobs are
//! republished after a backoff delay until their policy is exhausted, then
//! moved to `webhook_jobs.dead`.
//!
//! [`run_supervised`] keeps the worker alive: a failed connection or a closed
//! consumer is restarted with capped exponential backoff until shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
    Channel, Connection, ConnectionProperties,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::dispatch::Dispatcher;
use crate::handlers::HandlerError;
use crate::queue::publisher::declare_queues;
use crate::queue::{AmqpJobQueue, DeadLetter, DispatchJob, JobStatus, JOB_QUEUE};

/// What to do with a job whose handler failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Republish `job` after `delay`
    Retry { job: DispatchJob, delay: Duration },
    /// Give up and move the job to the dead-letter queue
    DeadLetter { reason: String },
}

/// Decide between retrying and dead-lettering a failed job.
///
/// Non-retryable errors (bad payloads, client errors, panics) are
/// dead-lettered immediately.
pub fn plan_retry(job: &DispatchJob, err: &HandlerError) -> RetryDecision {
    if !err.is_retryable() {
        return RetryDecision::DeadLetter {
            reason: format!("non-retryable failure: {}", err),
        };
    }

    if !job.policy.should_retry(job.attempt) {
        return RetryDecision::DeadLetter {
            reason: format!(
                "exhausted {} attempts, last error: {}",
                job.policy.max_attempts, err
            ),
        };
    }

    RetryDecision::Retry {
        delay: job.policy.delay_for(job.attempt, err.retry_after()),
        job: job.next_attempt(),
    }
}

/// First wait before restarting a worker that stopped.
pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Longest wait between worker restarts.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Run [`run`] until shutdown, restarting it whenever it returns.
pub async fn run_supervised(
    amqp_url: String,
    concurrency: usize,
    dispatcher: Arc<Dispatcher>,
    queue: AmqpJobQueue,
    shutdown: watch::Receiver<bool>,
) {
    supervise(
        shutdown,
        RECONNECT_INITIAL_DELAY,
        RECONNECT_MAX_DELAY,
        |shutdown| {
            let url = amqp_url.clone();
            let dispatcher = Arc::clone(&dispatcher);
            let queue = queue.clone();
            async move { run(&url, concurrency, dispatcher, queue, shutdown).await }
        },
    )
    .await;
}

/// Call `start` until `shutdown` flips to true.
///
/// Each time the worker returns, with an error or because its consumer
/// closed, the next start waits `initial_delay` doubled per consecutive
/// restart and capped at `max_delay`. A clean return resets the delay.
pub async fn supervise<F, Fut>(
    mut shutdown: watch::Receiver<bool>,
    initial_delay: Duration,
    max_delay: Duration,
    mut start: F,
) where
    F: FnMut(watch::Receiver<bool>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut delay = initial_delay;
    let mut restarts: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let result = start(shutdown.clone()).await;
        if *shutdown.borrow() {
            break;
        }

        match result {
            Ok(()) => {
                warn!(restarts = restarts, "worker_consumer_ended");
                delay = initial_delay;
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), restarts = restarts, "worker_failed");
            }
        }

        info!(
            delay_ms = delay.as_millis() as u64,
            restarts = restarts,
            "worker_restart_scheduled"
        );

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        restarts = restarts.saturating_add(1);
        delay = delay.saturating_mul(2).min(max_delay);
    }

    info!(restarts = restarts, "worker_supervisor_stopped");
}

/// Run the job worker until `shutdown` flips to true.
///
/// This function:
/// 1. Connects to RabbitMQ using the configured URL
/// 2. Sets QoS prefetch to the worker concurrency
/// 3. Declares the job and dead-letter queues (idempotent)
/// 4. Consumes jobs, spawning a task for each
pub async fn run(
    amqp_url: &str,
    concurrency: usize,
    dispatcher: Arc<Dispatcher>,
    queue: AmqpJobQueue,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(url_length = amqp_url.len(), "rabbitmq_connecting");

    let conn = Connection::connect(amqp_url, ConnectionProperties::default())
        .await
        .context("Failed to connect to RabbitMQ")?;

    info!("rabbitmq_connected");

    let channel = conn
        .create_channel()
        .await
        .context("Failed to create channel")?;

    let prefetch_count = u16::try_from(concurrency).unwrap_or(u16::MAX);
    channel
        .basic_qos(prefetch_count, BasicQosOptions::default())
        .await
        .context("Failed to set QoS")?;

    info!(prefetch_count = prefetch_count, "rabbitmq_qos_set");

    declare_queues(&channel).await?;

    let mut consumer = channel
        .basic_consume(
            JOB_QUEUE,
            "leadhook-worker",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("Failed to start consumer")?;

    info!(queue = JOB_QUEUE, "rabbitmq_consumer_started");
    info!("worker_ready");

    let channel = Arc::new(channel);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("worker_stopping");
                break;
            }
            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let dispatcher = Arc::clone(&dispatcher);
                        let channel = Arc::clone(&channel);
                        let queue = queue.clone();

                        tokio::spawn(async move {
                            handle_delivery(delivery, &dispatcher, &queue, &channel).await;
                        });
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "rabbitmq_delivery_error");
                    }
                    None => {
                        warn!("rabbitmq_consumer_closed");
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = channel.close(200, "Normal shutdown").await {
        warn!(error = %e, "rabbitmq_channel_close_error");
    }
    if let Err(e) = conn.close(200, "Normal shutdown").await {
        warn!(error = %e, "rabbitmq_connection_close_error");
    }

    info!("worker_shutdown_complete");
    Ok(())
}

async fn handle_delivery(
    delivery: Delivery,
    dispatcher: &Dispatcher,
    queue: &AmqpJobQueue,
    channel: &Channel,
) {
    let delivery_tag = delivery.delivery_tag;
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let job: DispatchJob = match serde_json::from_slice(&delivery.data) {
        Ok(job) => job,
        Err(e) => {
            error!(
                message_id = %message_id,
                delivery_tag = delivery_tag,
                error = %e,
                "rabbitmq_job_parse_failed"
            );
            // Poison message: never requeue.
            nack(channel, delivery_tag, false).await;
            return;
        }
    };

    let registry = queue.registry();
    registry.set(&job.job_id, JobStatus::Active);

    info!(
        queue = JOB_QUEUE,
        job_id = %job.job_id,
        webhook_id = %job.webhook_id,
        provider = %job.envelope.source,
        event_type = %job.envelope.event_type,
        attempt = job.attempt,
        "rabbitmq_job_received"
    );

    let err = match dispatcher.execute_job(&job).await {
        Ok(()) => {
            registry.set(&job.job_id, JobStatus::Completed);
            info!(
                job_id = %job.job_id,
                webhook_id = %job.webhook_id,
                attempt = job.attempt,
                "rabbitmq_job_completed"
            );
            ack(channel, delivery_tag).await;
            return;
        }
        Err(err) => err,
    };

    match plan_retry(&job, &err) {
        RetryDecision::Retry { job: next, delay } => {
            registry.set(&job.job_id, JobStatus::Retrying { attempt: next.attempt });
            warn!(
                job_id = %job.job_id,
                webhook_id = %job.webhook_id,
                event_type = %job.envelope.event_type,
                attempt = job.attempt,
                next_attempt = next.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "rabbitmq_job_retry_scheduled"
            );

            tokio::time::sleep(delay).await;

            match queue.publish_job(&next).await {
                Ok(()) => ack(channel, delivery_tag).await,
                Err(e) => {
                    error!(job_id = %job.job_id, error = %e, "rabbitmq_job_republish_failed");
                    nack(channel, delivery_tag, true).await;
                }
            }
        }
        RetryDecision::DeadLetter { reason } => {
            error!(
                job_id = %job.job_id,
                webhook_id = %job.webhook_id,
                provider = %job.envelope.source,
                event_type = %job.envelope.event_type,
                event_id = %job.envelope.id,
                priority = job.priority.as_str(),
                attempt = job.attempt,
                reason = %reason,
                "rabbitmq_job_dead_lettered"
            );

            let dead = DeadLetter {
                job: job.clone(),
                reason: reason.clone(),
                failed_at: Utc::now(),
            };

            match queue.publish_dead_letter(&dead).await {
                Ok(()) => {
                    registry.set(&job.job_id, JobStatus::DeadLettered { reason });
                    ack(channel, delivery_tag).await;
                }
                Err(e) => {
                    error!(job_id = %job.job_id, error = %e, "rabbitmq_dead_letter_failed");
                    nack(channel, delivery_tag, true).await;
                }
            }
        }
    }
}

async fn ack(channel: &Channel, delivery_tag: u64) {
    if let Err(e) = channel
        .basic_ack(delivery_tag, BasicAckOptions::default())
        .await
    {
        error!(delivery_tag = delivery_tag, error = %e, "rabbitmq_ack_failed");
    }
}

async fn nack(channel: &Channel, delivery_tag: u64, requeue: bool) {
    if let Err(e) = channel
        .basic_nack(
            delivery_tag,
            BasicNackOptions {
                requeue,
                ..Default::default()
            },
        )
        .await
    {
        error!(delivery_tag = delivery_tag, error = %e, "rabbitmq_nack_failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientError;
    use crate::dispatch::Priority;
    use crate::normalize::{ProviderKind, WebhookEnvelope};
    use crate::clients::{BirdClient, HttpCalendarClient, HubSpotClient};
    use crate::dispatch::ProviderProfile;
    use crate::handlers::HandlerContext;
    use crate::queue::{JobRegistry, RetryPolicy};
    use crate::Config;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn job() -> DispatchJob {
        let envelope = WebhookEnvelope {
            id: "evt_7".to_string(),
            event_type: "message.received".to_string(),
            timestamp: Utc::now(),
            source: ProviderKind::Messaging,
            origin: None,
            payload: Map::new(),
        };
        DispatchJob::new(envelope, "bird_1_abc".into(), Priority::Normal, RetryPolicy::default())
    }

    fn transient() -> HandlerError {
        HandlerError::Upstream(ClientError::Timeout(Duration::from_secs(30)))
    }

    #[test]
    fn test_retry_schedule_then_dead_letter() {
        let first = job();

        let RetryDecision::Retry { job: second, delay } = plan_retry(&first, &transient()) else {
            panic!("first failure should retry");
        };
        assert_eq!(delay, Duration::from_millis(2000));
        assert_eq!(second.attempt, 1);

        let RetryDecision::Retry { job: third, delay } = plan_retry(&second, &transient()) else {
            panic!("second failure should retry");
        };
        assert_eq!(delay, Duration::from_millis(4000));
        assert_eq!(third.attempt, 2);

        match plan_retry(&third, &transient()) {
            RetryDecision::DeadLetter { reason } => {
                assert!(reason.contains("exhausted 3 attempts"))
            }
            other => panic!("expected dead letter, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_payload_is_dead_lettered_immediately() {
        let decision = plan_retry(&job(), &HandlerError::InvalidPayload("no contact".into()));
        assert!(matches!(decision, RetryDecision::DeadLetter { .. }));
    }

    #[test]
    fn test_rate_limit_hint_raises_delay() {
        let err = HandlerError::Upstream(ClientError::RateLimited {
            retry_after: Some(Duration::from_secs(15)),
        });
        let RetryDecision::Retry { delay, .. } = plan_retry(&job(), &err) else {
            panic!("rate limit should retry");
        };
        assert_eq!(delay, Duration::from_secs(15));
    }

    fn unreachable_queue() -> AmqpJobQueue {
        // Nothing listens on port 1.
        AmqpJobQueue::new(
            "amqp://127.0.0.1:1".to_string(),
            Arc::new(JobRegistry::default()),
            true,
        )
    }

    fn dispatcher(queue: &AmqpJobQueue) -> Arc<Dispatcher> {
        let config = Config::from_lookup(|_: &str| None);
        let timeout = Duration::from_secs(1);
        let ctx = HandlerContext {
            crm: Arc::new(HubSpotClient::new(&config.hubspot_base_url, None, timeout, 1).unwrap()),
            messaging: Arc::new(
                BirdClient::new(&config.bird_api_base_url, None, None, None, timeout, 1).unwrap(),
            ),
            calendar: Arc::new(
                HttpCalendarClient::new(&config.calendar_api_base_url, None, timeout, 1).unwrap(),
            ),
        };
        Arc::new(Dispatcher::new(
            ProviderProfile::all_from_config(&config),
            Arc::new(queue.clone()),
            ctx,
            RetryPolicy::default(),
        ))
    }

    #[tokio::test]
    async fn test_connect_failure_is_retried() {
        let queue = unreachable_queue();
        let dispatcher = dispatcher(&queue);
        let (tx, rx) = watch::channel(false);
        let attempts = AtomicUsize::new(0);

        let supervised = supervise(
            rx,
            Duration::from_millis(1),
            Duration::from_millis(4),
            |shutdown| {
                if attempts.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    let _ = tx.send(true);
                }
                let dispatcher = Arc::clone(&dispatcher);
                let queue = queue.clone();
                async move { run("amqp://127.0.0.1:1", 1, dispatcher, queue, shutdown).await }
            },
        );
        tokio::time::timeout(Duration::from_secs(10), supervised)
            .await
            .expect("supervisor should stop after shutdown");

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_closed_consumer_is_restarted() {
        let (tx, rx) = watch::channel(false);
        let attempts = AtomicUsize::new(0);

        let supervised = supervise(
            rx,
            Duration::from_millis(1),
            Duration::from_millis(4),
            |_shutdown| {
                if attempts.fetch_add(1, Ordering::SeqCst) + 1 == 4 {
                    let _ = tx.send(true);
                }
                async { Ok::<(), anyhow::Error>(()) }
            },
        );
        tokio::time::timeout(Duration::from_secs(5), supervised)
            .await
            .expect("supervisor should stop after shutdown");

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let (tx, rx) = watch::channel(false);
        let attempts = AtomicUsize::new(0);

        let supervised = supervise(
            rx,
            Duration::from_secs(60),
            Duration::from_secs(60),
            |_shutdown| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::anyhow!("connection refused")) }
            },
        );
        let stop = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(supervised, stop);
        })
        .await
        .expect("shutdown should cut the backoff short");

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_start_after_shutdown() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let attempts = AtomicUsize::new(0);

        supervise(rx, Duration::from_millis(1), Duration::from_millis(1), |_shutdown| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), anyhow::Error>(()) }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }
}
