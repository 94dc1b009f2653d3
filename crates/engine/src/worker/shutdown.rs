//! Shutdown coordination
//!
//! The coordinator is the one handle shared between whoever receives
//! termination signals (the binary) and the dispatcher. It carries:
//! - the stop request (first signal): stop fetching, drain in-flight work
//! - the force request (second signal): stop waiting for the drain
//! - the dispatcher's current state, so callers can wait for `Stopped`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{info, trace, warn};

use super::slots::SlotPool;

/// Dispatcher lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Not started yet
    Idle,
    /// Waiting on the broker for the next message
    Fetching,
    /// Resolving a message and waiting for a slot to run it in
    Dispatching,
    /// No longer fetching; waiting for in-flight executions
    Draining,
    /// Dispatcher has exited
    Stopped,
}

impl std::fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Dispatching => "dispatching",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

struct CoordinatorInner {
    state: watch::Sender<DispatcherState>,
    stop: watch::Sender<bool>,
    force: watch::Sender<bool>,
    shutting_down: Arc<AtomicBool>,
    slots: RwLock<Option<SlotPool>>,
}

/// Shutdown coordinator
///
/// # Example
///
/// ```ignore
/// let shutdown = ShutdownCoordinator::new();
/// let worker = Worker::new(config, broker, backend, registry, shutdown.clone());
/// let handle = tokio::spawn(worker.run());
///
/// shutdown.signal();
/// assert!(shutdown.wait(Duration::from_secs(30)).await);
/// ```
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    /// Create a coordinator in the `Idle` state
    pub fn new() -> Self {
        let (state, _) = watch::channel(DispatcherState::Idle);
        let (stop, _) = watch::channel(false);
        let (force, _) = watch::channel(false);
        Self {
            inner: Arc::new(CoordinatorInner {
                state,
                stop,
                force,
                shutting_down: Arc::new(AtomicBool::new(false)),
                slots: RwLock::new(None),
            }),
        }
    }

    /// Request a graceful shutdown: stop fetching, drain in-flight tasks
    ///
    /// Idempotent.
    pub fn signal(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        if !self.inner.stop.send_replace(true) {
            info!(
                active = self.active_executions(),
                "shutdown requested, draining in-flight tasks"
            );
        }
    }

    /// Request an immediate shutdown: abandon in-flight tasks now
    pub fn force(&self) {
        self.signal();
        if !self.inner.force.send_replace(true) {
            warn!(
                active = self.active_executions(),
                "forced shutdown requested, abandoning in-flight tasks"
            );
        }
    }

    /// Whether a shutdown was requested
    pub fn is_signaled(&self) -> bool {
        *self.inner.stop.borrow()
    }

    /// Whether a forced shutdown was requested
    pub fn is_forced(&self) -> bool {
        *self.inner.force.borrow()
    }

    /// Wait until the dispatcher reaches `Stopped`
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut state = self.inner.state.subscribe();
        let stopped = matches!(
            tokio::time::timeout(timeout, state.wait_for(|s| *s == DispatcherState::Stopped))
                .await,
            Ok(Ok(_))
        );
        stopped
    }

    /// Current dispatcher state
    pub fn state(&self) -> DispatcherState {
        *self.inner.state.borrow()
    }

    /// Number of executions currently holding a slot
    pub fn active_executions(&self) -> usize {
        self.inner
            .slots
            .read()
            .as_ref()
            .map_or(0, SlotPool::active)
    }

    pub(crate) fn set_state(&self, state: DispatcherState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            trace!(from = %previous, to = %state, "dispatcher state");
        }
    }

    pub(crate) fn attach(&self, slots: SlotPool) {
        *self.inner.slots.write() = Some(slots);
    }

    pub(crate) fn stop_receiver(&self) -> watch::Receiver<bool> {
        self.inner.stop.subscribe()
    }

    pub(crate) fn force_receiver(&self) -> watch::Receiver<bool> {
        self.inner.force.subscribe()
    }

    /// Flag handed to task contexts for cooperative shutdown checks
    pub(crate) fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.inner.shutting_down)
    }
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("state", &self.state())
            .field("signaled", &self.is_signaled())
            .field("forced", &self.is_forced())
            .finish()
    }
}
