//! Leadhook Gateway - webhook receiver and job worker.
//!
//! One process serves the HTTP endpoints and, when any provider is queued,
//! consumes the `webhook_jobs` queue so job status stays visible to the
//! status endpoint. The worker is restarted whenever it stops before shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal, sync::watch};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use leadhook::clients::{BirdClient, HttpCalendarClient, HubSpotClient};
use leadhook::{
    consumer, web, AmqpJobQueue, AppState, Config, Dispatcher, HandlerContext, JobRegistry,
    ProviderKind, ProviderProfile, RetryPolicy,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("gateway_starting");

    let config = Config::from_env();
    info!(
        port = config.port,
        cloudamqp_url_set = !config.cloudamqp_url.is_empty(),
        bird_queued = config.queue_enabled_for(ProviderKind::Messaging),
        hubspot_queued = config.queue_enabled_for(ProviderKind::Pipeline),
        calendar_queued = config.queue_enabled_for(ProviderKind::Calendar),
        queue_dedupe = config.queue_dedupe,
        bird_secret_configured = config.bird_webhook_secret.is_some(),
        hubspot_secret_configured = config.hubspot_webhook_secret.is_some(),
        calendar_secret_configured = config.calendar_webhook_secret.is_some(),
        worker_concurrency = config.worker_concurrency,
        "config_loaded"
    );

    let timeout = config.request_timeout();
    let ctx = HandlerContext {
        crm: Arc::new(
            HubSpotClient::new(
                &config.hubspot_base_url,
                config.hubspot_access_token.as_deref(),
                timeout,
                config.upstream_max_retries,
            )
            .context("Failed to create HubSpot client")?,
        ),
        messaging: Arc::new(
            BirdClient::new(
                &config.bird_api_base_url,
                config.bird_api_key.as_deref(),
                config.bird_workspace_id.as_deref(),
                config.bird_whatsapp_channel_id.as_deref(),
                timeout,
                config.upstream_max_retries,
            )
            .context("Failed to create Bird client")?,
        ),
        calendar: Arc::new(
            HttpCalendarClient::new(
                &config.calendar_api_base_url,
                config.calendar_api_key.as_deref(),
                timeout,
                config.upstream_max_retries,
            )
            .context("Failed to create calendar client")?,
        ),
    };

    let registry = Arc::new(JobRegistry::default());
    let queue = AmqpJobQueue::new(config.cloudamqp_url.clone(), registry, config.queue_dedupe);
    info!("rabbitmq_publisher_created");

    let dispatcher = Arc::new(Dispatcher::new(
        ProviderProfile::all_from_config(&config),
        Arc::new(queue.clone()),
        ctx,
        RetryPolicy::from_config(&config),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = if config.any_queue_enabled() {
        let url = config.cloudamqp_url.clone();
        let concurrency = config.worker_concurrency;
        let dispatcher = Arc::clone(&dispatcher);
        let queue = queue.clone();
        Some(tokio::spawn(consumer::run_supervised(
            url,
            concurrency,
            dispatcher,
            queue,
            shutdown_rx,
        )))
    } else {
        info!("worker_disabled");
        None
    };

    let state = AppState::new(config.clone(), dispatcher);
    let app = web::app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let _ = shutdown_tx.send(true);
    if let Some(worker) = worker {
        if let Err(e) = worker.await {
            error!(error = %e, "worker_join_failed");
        }
    }

    queue.close().await;

    info!("gateway_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("gateway_shutting_down");
}
