// Taskward worker
//
// Design Decision: One process = one worker pool with a fixed number of slots.
// Design Decision: First SIGTERM/SIGINT drains, a second one stops immediately.
// Design Decision: Exit status is 0 after any orderly stop (abandoned tasks are
// redelivered by the broker) and non-zero when startup fails.

mod config;
mod tasks;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use taskward_engine::{
    BrokerClient, InMemoryBroker, InMemoryResultBackend, PostgresBroker, PostgresResultBackend,
    ResultBackend, ShutdownCoordinator, TaskRegistry, Worker,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::{Cli, Transport, WorkerSettings};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before parsing so it can supply flag defaults
    let dotenv = dotenvy::dotenv();

    let cli = Cli::parse();
    let settings = WorkerSettings::from_cli(cli).context("Invalid configuration")?;

    init_tracing(settings.log_level);
    if let Ok(path) = dotenv {
        info!("Loaded .env from {:?}", path);
    }

    info!(
        worker_id = %settings.worker.worker_id,
        concurrency = settings.worker.concurrency,
        queues = ?settings.queues,
        "taskward-worker starting..."
    );

    let (broker, backend) = build_transports(&settings).await?;

    let mut registry = TaskRegistry::new();
    tasks::register_builtin(&mut registry).context("Failed to register built-in tasks")?;

    let shutdown = ShutdownCoordinator::new();
    tokio::spawn(handle_signals(shutdown.clone()));

    let worker = Worker::new(settings.worker, broker, backend, registry, shutdown);
    let report = worker.run().await.context("Worker failed to start")?;

    if report.abandoned() > 0 {
        warn!(
            abandoned = report.abandoned(),
            "Worker stopped with abandoned tasks; the broker will redeliver them"
        );
    }
    info!("Worker shutdown complete");
    Ok(())
}

/// Install the global subscriber
///
/// `RUST_LOG` wins when set; otherwise the configured level applies to the
/// worker's own crates and everything else logs warnings only.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,taskward_engine={level},taskward_worker={level}"
        ))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Build the broker and result backend selected by the settings
async fn build_transports(
    settings: &WorkerSettings,
) -> Result<(Arc<dyn BrokerClient>, Arc<dyn ResultBackend>)> {
    // Slots plus the dispatcher's fetch connection
    let max_connections = u32::try_from(settings.worker.concurrency)
        .unwrap_or(u32::MAX)
        .saturating_add(2);

    let mut broker_pool = None;
    let broker: Arc<dyn BrokerClient> = match &settings.broker {
        Transport::Memory => {
            warn!("Using in-memory broker; messages are not shared with other processes");
            Arc::new(
                InMemoryBroker::with_queues(settings.queues.clone())
                    .with_visibility_timeout(settings.visibility_timeout),
            )
        }
        Transport::Postgres(url) => {
            let pool = connect_pool(url, max_connections).await?;
            let broker = PostgresBroker::new(pool.clone(), settings.queues.clone())
                .with_visibility_timeout(settings.visibility_timeout);
            broker
                .migrate()
                .await
                .context("Failed to apply migrations")?;
            broker_pool = Some(pool);
            Arc::new(broker)
        }
    };

    let backend: Arc<dyn ResultBackend> = match (&settings.backend, broker_pool) {
        (Transport::Memory, _) => Arc::new(InMemoryResultBackend::new()),
        // Same database as the broker: share its pool and schema
        (Transport::Postgres(url), Some(pool)) if settings.broker == settings.backend => {
            info!(url = %redact(url), "Storing results alongside the broker");
            Arc::new(PostgresResultBackend::new(pool))
        }
        (Transport::Postgres(url), _) => {
            let pool = connect_pool(url, max_connections).await?;
            PostgresBroker::new(pool.clone(), vec![])
                .migrate()
                .await
                .context("Failed to apply result backend migrations")?;
            Arc::new(PostgresResultBackend::new(pool))
        }
    };

    Ok((broker, backend))
}

async fn connect_pool(url: &str, max_connections: u32) -> Result<PgPool> {
    info!(url = %redact(url), "Connecting to PostgreSQL");
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(url)
        .await
        .context("Failed to connect to PostgreSQL")
}

/// Hide the password in a connection URL before logging it
fn redact(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.rsplit_once('@') {
        Some((credentials, host)) => {
            let user = credentials.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        None => url.to_string(),
    }
}

/// Forward termination signals to the coordinator
///
/// Docker sends SIGTERM, Ctrl+C sends SIGINT. The first drains, the second forces.
#[cfg(unix)]
async fn handle_signals(shutdown: ShutdownCoordinator) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "Failed to install signal handlers");
                return;
            }
        };

    for forced in [false, true] {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        if forced {
            warn!(signal = name, "Second signal received, stopping without drain");
            shutdown.force();
        } else {
            info!(signal = name, "Starting graceful shutdown...");
            shutdown.signal();
        }
    }
}

/// Forward Ctrl+C to the coordinator (non-Unix platforms)
#[cfg(not(unix))]
async fn handle_signals(shutdown: ShutdownCoordinator) {
    for forced in [false, true] {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        if forced {
            warn!("Second signal received, stopping without drain");
            shutdown.force();
        } else {
            info!("Shutdown signal received, starting graceful shutdown...");
            shutdown.signal();
        }
    }
}
