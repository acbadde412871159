use anyhow::{Context, Result};
use live_recorder::config::LoggingConfig;
use live_recorder::{
    AccountIdentifier, CommandCapture, Config, HelixClient, LivePoller, RateLimiter,
    RecordingCoordinator, SqliteStore, StorageSelector, TokenStore, UserResolver,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging; the guard flushes the file sink on exit
    let _log_guard = init_tracing(&config.logging);

    config.validate().context("Invalid configuration")?;

    info!(
        service = %config.service.name,
        accounts = config.polling.accounts.len(),
        "Starting Live Recorder"
    );

    // Initialize metrics
    if config.service.metrics_port != 0 {
        init_metrics(config.service.metrics_port)?;
    }

    // Initialize components
    let store = Arc::new(
        SqliteStore::connect(&config.database)
            .await
            .context("Failed to open database")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let client = Arc::new(HelixClient::new(&config.api).context("Failed to build HTTP client")?);

    let tokens = Arc::new(TokenStore::new(client.clone(), config.token.retry_delay()));
    tokens
        .refresh()
        .await
        .context("Failed to acquire initial access token")?;

    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit.max_requests,
        config.rate_limit.period(),
    ));

    let resolver = Arc::new(UserResolver::new(
        client.clone(),
        store.clone(),
        tokens.clone(),
        limiter.clone(),
    ));

    let coordinator = Arc::new(RecordingCoordinator::new(
        Arc::new(StorageSelector::from_config(&config.storage)),
        store.clone(),
        Arc::new(CommandCapture::from_config(&config.capture)),
        config.capture.max_concurrent,
        config.capture.cooldown(),
    ));

    let poller = Arc::new(LivePoller::new(
        client,
        tokens.clone(),
        limiter,
        coordinator.clone(),
        config.api.max_batch_size,
        config.polling.interval(),
        config.polling.error_delay(),
    ));

    let identifiers: Vec<AccountIdentifier> = config
        .polling
        .accounts
        .iter()
        .filter(|a| !a.trim().is_empty())
        .map(|a| AccountIdentifier::parse(a))
        .collect();

    let cancel = CancellationToken::new();

    // Spawn token refresher task
    let refresher_handle = tokio::spawn(
        tokens
            .clone()
            .run_refresher(config.token.refresh_interval(), cancel.clone()),
    );

    // Spawn poller task
    let poller_handle = tokio::spawn(poller.run(resolver, identifiers, cancel.clone()));

    // Spawn status logger task
    let status_handle = tokio::spawn(
        coordinator
            .clone()
            .run_status_logger(STATUS_LOG_INTERVAL, cancel.clone()),
    );

    info!("Live recorder started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down live recorder");

    cancel.cancel();
    for (name, handle) in [
        ("poller", poller_handle),
        ("token refresher", refresher_handle),
        ("status logger", status_handle),
    ] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "Task ended abnormally");
        }
    }

    // Abort captures; their child processes are killed on drop
    coordinator.shutdown().await;
    store.pool().close().await;

    info!("Live recorder stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(config: &LoggingConfig) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console = if config.format == "json" {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().compact().boxed()
    };

    let (file, guard) = match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "live-recorder.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file)
        .init();

    guard
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
