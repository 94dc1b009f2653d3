//! Dispatcher control loop
//!
//! ```text
//! Idle ──► Fetching ──► Dispatching ──┐
//!             ▲                        │
//!             └────────────────────────┘
//!             │ shutdown signal
//!             ▼
//!          Draining ──► Stopped
//! ```
//!
//! The loop runs on a single task. It suspends only while fetching and
//! while waiting for a slot; executions run on their own spawned tasks and
//! report their own outcome before giving the slot back.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

use super::poller::BrokerPoller;
use super::reporter::{ReportAction, ResultReporter};
use super::shutdown::{DispatcherState, ShutdownCoordinator};
use super::slots::{Slot, SlotPool};
use crate::broker::BrokerError;
use crate::engine::{RegisteredTask, TaskRegistry};
use crate::task::{ExecutionRecord, TaskContext, TaskMessage};

/// How the drain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReport {
    /// Every in-flight execution finished and reported
    Completed,
    /// The drain timeout elapsed; `abandoned` executions were left running
    /// and their messages unacknowledged
    TimedOut { abandoned: usize },
    /// A forced shutdown cut the drain short
    Forced { abandoned: usize },
}

impl DrainReport {
    /// Number of executions abandoned to broker redelivery
    pub fn abandoned(&self) -> usize {
        match self {
            Self::Completed => 0,
            Self::TimedOut { abandoned } | Self::Forced { abandoned } => *abandoned,
        }
    }

    /// Whether every execution finished before stopping
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// The dispatcher state machine
pub(crate) struct Dispatcher {
    registry: Arc<TaskRegistry>,
    slots: SlotPool,
    reporter: Arc<ResultReporter>,
    poller: BrokerPoller,
    shutdown: ShutdownCoordinator,
    drain_timeout: Duration,
    running: JoinSet<()>,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: Arc<TaskRegistry>,
        slots: SlotPool,
        reporter: Arc<ResultReporter>,
        poller: BrokerPoller,
        shutdown: ShutdownCoordinator,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            slots,
            reporter,
            poller,
            shutdown,
            drain_timeout,
            running: JoinSet::new(),
        }
    }

    /// Run until shutdown, then drain
    pub(crate) async fn run(mut self) -> DrainReport {
        let mut stop = self.shutdown.stop_receiver();

        while !self.shutdown.is_signaled() {
            self.reap();

            self.shutdown.set_state(DispatcherState::Fetching);
            let Some(message) = self.poller.next().await else {
                break;
            };

            self.shutdown.set_state(DispatcherState::Dispatching);
            self.dispatch(message, &mut stop).await;
        }

        self.drain().await
    }

    /// Route one fetched message: reply directly or start an execution
    async fn dispatch(&mut self, message: TaskMessage, stop: &mut watch::Receiver<bool>) {
        let now = Utc::now();

        if message.is_expired(now) {
            let result = self.reporter.report_expired(&message).await;
            log_report(&message, result);
            return;
        }

        // Brokers without native delayed delivery may hand out messages early
        if let Some(delay) = message.delay_until_eta(now) {
            debug!(task_id = %message.id, delay_ms = delay.as_millis(), "message not due yet");
            let result = self.reporter.release_unstarted(&message, delay).await;
            log_report(&message, result);
            return;
        }

        let task = match self.registry.resolve(&message.task) {
            Ok(task) => task,
            Err(e) => {
                let result = self.reporter.report_unknown(&message, &e).await;
                log_report(&message, result);
                return;
            }
        };

        // Back-pressure point: no fetch happens while every slot is busy
        let slot = tokio::select! {
            biased;
            _ = stop.wait_for(|stop| *stop) => None,
            slot = self.slots.acquire() => match slot {
                Ok(slot) => Some(slot),
                Err(e) => {
                    error!(error = %e, "failed to acquire execution slot");
                    None
                }
            },
        };

        let Some(slot) = slot else {
            info!(task_id = %message.id, task = %message.task, "returning unstarted message to broker");
            let result = self
                .reporter
                .release_unstarted(&message, Duration::ZERO)
                .await;
            log_report(&message, result);
            return;
        };

        self.spawn(task, message, slot);
    }

    fn spawn(&mut self, task: Arc<RegisteredTask>, message: TaskMessage, slot: Slot) {
        let record = ExecutionRecord::start(message, slot.index());
        let ctx = TaskContext::new(
            record.task_id(),
            record.task_name(),
            record.retries(),
            task.policy().retry.max_retries,
            slot.index(),
            self.shutdown.flag(),
        );
        let reporter = Arc::clone(&self.reporter);
        let span = tracing::info_span!(
            "execute",
            task_id = %record.task_id(),
            task = %record.task_name(),
            slot = slot.index(),
            retries = record.retries(),
        );

        debug!(
            parent: &span,
            active = self.slots.active(),
            capacity = self.slots.capacity(),
            "starting task"
        );

        self.running.spawn(
            async move {
                let outcome = task.invoke(ctx, &record.message.payload).await;
                let result = reporter.report(&record, task.policy(), outcome).await;
                log_report(&record.message, result);
                // Slot is released only after the outcome is reported
                drop(slot);
            }
            .instrument(span),
        );
    }

    /// Collect finished executions without waiting
    fn reap(&mut self) {
        while let Some(result) = self.running.try_join_next() {
            log_join(result);
        }
    }

    async fn drain(mut self) -> DrainReport {
        self.shutdown.set_state(DispatcherState::Draining);
        self.reap();

        let in_flight = self.running.len();
        info!(
            in_flight,
            timeout_secs = self.drain_timeout.as_secs_f64(),
            "Draining in-flight tasks"
        );

        let mut force = self.shutdown.force_receiver();
        let running = &mut self.running;
        let join_all = async {
            while let Some(result) = running.join_next().await {
                log_join(result);
            }
        };

        let report = tokio::select! {
            biased;
            finished = tokio::time::timeout(self.drain_timeout, join_all) => match finished {
                Ok(()) => DrainReport::Completed,
                Err(_) => DrainReport::TimedOut { abandoned: 0 },
            },
            _ = force.wait_for(|forced| *forced) => DrainReport::Forced { abandoned: 0 },
        };

        let report = match report {
            DrainReport::Completed => {
                info!("All in-flight tasks finished");
                report
            }
            DrainReport::TimedOut { .. } | DrainReport::Forced { .. } => {
                // Late finishers must not ack: their messages belong to the broker now
                self.reporter.seal();
                let abandoned = self.running.len();
                self.running.detach_all();
                warn!(
                    abandoned,
                    "Stopping with tasks still running; their messages will be redelivered"
                );
                match report {
                    DrainReport::Forced { .. } => DrainReport::Forced { abandoned },
                    _ => DrainReport::TimedOut { abandoned },
                }
            }
        };

        self.shutdown.set_state(DispatcherState::Stopped);
        report
    }
}

fn log_report(message: &TaskMessage, result: Result<ReportAction, BrokerError>) {
    match result {
        Ok(action) => debug!(task_id = %message.id, ?action, "reported"),
        // Without an ack/reject the broker redelivers after its visibility window
        Err(e) => error!(task_id = %message.id, error = %e, "failed to reply to broker"),
    }
}

fn log_join(result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "execution task failed");
    }
}
