//! Worker facade
//!
//! Wires broker, result backend, registry and slot pool into a dispatcher
//! and runs it to completion.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};
use uuid::Uuid;

use super::dispatcher::{Dispatcher, DrainReport};
use super::poller::{BrokerPoller, PollerConfig};
use super::reporter::ResultReporter;
use super::shutdown::{DispatcherState, ShutdownCoordinator};
use super::slots::SlotPool;
use crate::backend::ResultBackend;
use crate::broker::{BrokerClient, BrokerError};
use crate::engine::TaskRegistry;

/// Worker configuration
///
/// The consumed queues belong to the broker client, see
/// [`BrokerClient::queues`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Number of execution slots
    pub concurrency: usize,

    /// How long in-flight tasks get to finish after a shutdown signal
    #[serde(with = "crate::duration_millis")]
    pub drain_timeout: Duration,

    /// Poller configuration
    pub poller: PollerConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            concurrency: 4,
            drain_timeout: Duration::from_secs(30),
            poller: PollerConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the number of execution slots
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the drain timeout
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The broker could not be reached at startup
    #[error("failed to connect to broker: {0}")]
    Connect(#[source] BrokerError),

    /// `run` was called on a coordinator that already stopped a worker
    #[error("worker already stopped")]
    AlreadyStopped,
}

/// A task worker
///
/// # Example
///
/// ```ignore
/// use taskward_engine::prelude::*;
///
/// let shutdown = ShutdownCoordinator::new();
/// let worker = Worker::new(
///     WorkerConfig::default().with_concurrency(4),
///     broker,
///     backend,
///     registry,
///     shutdown.clone(),
/// );
///
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     shutdown.signal();
/// });
///
/// let report = worker.run().await?;
/// ```
pub struct Worker {
    config: WorkerConfig,
    broker: Arc<dyn BrokerClient>,
    backend: Arc<dyn ResultBackend>,
    registry: Arc<TaskRegistry>,
    shutdown: ShutdownCoordinator,
}

impl Worker {
    /// Create a new worker
    pub fn new(
        config: WorkerConfig,
        broker: Arc<dyn BrokerClient>,
        backend: Arc<dyn ResultBackend>,
        registry: TaskRegistry,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            config,
            broker,
            backend,
            registry: Arc::new(registry),
            shutdown,
        }
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Get the configuration
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Get the shutdown coordinator
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Connect to the broker and process messages until shut down
    ///
    /// Blocks until the dispatcher reaches `Stopped`. Fails only if the
    /// broker is unreachable at startup; later transport errors are
    /// retried internally.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run(self) -> Result<DrainReport, WorkerError> {
        if self.shutdown.state() == DispatcherState::Stopped {
            return Err(WorkerError::AlreadyStopped);
        }

        if let Err(e) = self.broker.connect().await {
            error!(error = %e, "Broker unreachable at startup");
            self.shutdown.set_state(DispatcherState::Stopped);
            return Err(WorkerError::Connect(e));
        }

        let slots = SlotPool::new(self.config.concurrency);
        self.shutdown.attach(slots.clone());

        let reporter = Arc::new(ResultReporter::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.backend),
        ));
        let poller = BrokerPoller::new(
            Arc::clone(&self.broker),
            self.config.poller.clone(),
            self.shutdown.stop_receiver(),
        );

        info!(
            concurrency = slots.capacity(),
            queues = ?self.broker.queues(),
            tasks = ?self.registry.names().collect::<Vec<_>>(),
            "Worker ready"
        );

        let report = Dispatcher::new(
            self.registry,
            slots,
            reporter,
            poller,
            self.shutdown.clone(),
            self.config.drain_timeout,
        )
        .run()
        .await;

        info!(?report, "Worker stopped");
        Ok(report)
    }
}
