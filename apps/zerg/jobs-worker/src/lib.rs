//! Jobs Worker Service
//!
//! Executes background jobs published to the `jobs` queue.
//!
//! ## Architecture
//!
//! ```text
//! Publisher (any service)
//!   ↓ Job envelope (JSON)
//! Redis Stream (jobs, consumer group: job_workers)
//!   ↓
//! Worker (N consumption loops)
//!   ├── email.send     → EmailHandler
//!   └── audit.cleanup  → AuditCleanupHandler → PostgreSQL
//! ```
//!
//! Failed jobs are republished with a quadratic backoff until their retry
//! budget is spent. SIGINT/SIGTERM trigger a graceful shutdown bounded by
//! `JOBS_SHUTDOWN_TIMEOUT_SECS`.

pub mod handlers;
pub mod health;
pub mod settings;

use core_config::{FromEnv, database::DatabaseConfig};
use eyre::{Result, WrapErr};
use handlers::{AuditCleanupHandler, EmailHandler, LoggingEmailSender, PgAuditLogPurger};
use health::HealthState;
use job_worker::{QueueTransport, Worker, shutdown_channel, transport::RedisTransport};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use settings::Settings;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

async fn connect_database(config: &DatabaseConfig) -> Result<DatabaseConnection> {
    let mut opt = ConnectOptions::new(config.url.clone());
    opt.max_connections(5)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(8))
        .acquire_timeout(Duration::from_secs(8))
        .sqlx_logging(false);

    Database::connect(opt)
        .await
        .wrap_err("Failed to connect to PostgreSQL")
}

/// Run the jobs worker
///
/// 1. Loads settings and sets up tracing and metrics
/// 2. Connects to Redis (and PostgreSQL when `DATABASE_URL` is set)
/// 3. Registers handlers and starts the worker
/// 4. Serves health endpoints until SIGINT/SIGTERM, then drains
///
/// # Errors
///
/// Returns an error if configuration is invalid, a required backend is
/// unreachable, or the worker cannot start.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();

    let settings = Settings::from_env().wrap_err("Failed to load configuration")?;
    core_config::tracing::init_tracing(&settings.environment);
    health::init_metrics()?;

    info!(name = APP_NAME, version = APP_VERSION, "Starting jobs worker service");
    info!("Environment: {:?}", settings.environment);

    info!("Connecting to Redis...");
    let transport = RedisTransport::connect(&settings.redis.url)
        .await
        .wrap_err("Failed to connect to Redis")?
        .with_consumer_prefix(settings.consumer_prefix.clone());
    let transport: Arc<dyn QueueTransport> = Arc::new(transport);
    info!("Connected to Redis successfully");

    let worker = Arc::new(Worker::new(transport.clone(), settings.worker.clone()));
    worker.register_handler(EmailHandler::new(Arc::new(LoggingEmailSender)));

    match &settings.database {
        Some(database) => {
            info!("Connecting to PostgreSQL...");
            let db = connect_database(database).await?;
            info!("Connected to PostgreSQL successfully");
            worker.register_handler(AuditCleanupHandler::new(Arc::new(PgAuditLogPurger::new(db))));
        }
        None => warn!("DATABASE_URL not set, audit cleanup jobs will not be handled"),
    }

    info!(
        queue = %settings.worker.queue_name,
        concurrency = settings.worker.concurrency,
        handler_timeout_secs = settings.worker.handler_timeout.as_secs(),
        "Worker configuration loaded"
    );

    worker.start().await.wrap_err("Failed to start worker")?;

    let (health_stop, health_signal) = shutdown_channel();
    let health_state = HealthState {
        worker: worker.clone(),
        transport: transport.clone(),
        name: APP_NAME.to_string(),
        version: APP_VERSION.to_string(),
    };
    let health_config = settings.health.clone();
    let health_server = tokio::spawn(async move {
        let stop = async move { health_signal.triggered().await };
        if let Err(e) = health::start_health_server(health_state, &health_config, stop).await {
            error!(error = %e, "Health server failed");
        }
    });

    shutdown_signal().await;

    info!(timeout_secs = settings.shutdown_timeout.as_secs(), "Draining worker");
    if let Err(e) = worker.shutdown(settings.shutdown_timeout).await {
        error!(error = %e, "Worker did not shut down cleanly");
    }

    health_stop.send_replace(true);
    if let Err(e) = health_server.await {
        error!(error = %e, "Health server task failed");
    }

    if let Err(e) = transport.close().await {
        warn!(error = %e, "Failed to close transport");
    }

    info!("Jobs worker service stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating shutdown..."),
    }
}
