//! Worker runtime
//!
//! This module provides:
//! - [`SlotPool`]: fixed number of execution slots, handed out first-come first-served
//! - [`BrokerPoller`]: fetch loop with idle and reconnect backoff
//! - [`ResultReporter`]: outcome → result record + ack/reject
//! - [`ShutdownCoordinator`]: signal, force, wait for `Stopped`
//! - [`Worker`]: connects the pieces and runs the dispatcher
//!
//! ## Lifecycle
//!
//! ```text
//! Worker::run
//!   ├─ broker.connect()          (failure → WorkerError::Connect)
//!   ├─ dispatcher loop           Fetching ⇄ Dispatching
//!   │     └─ per message: slot → spawn(handler → report → release slot)
//!   ├─ signal()                  stop fetching
//!   └─ drain                     wait ≤ drain_timeout (or until force())
//!         └─ Stopped             remaining executions abandoned, reporter sealed
//! ```

mod dispatcher;
mod poller;
mod pool;
mod reporter;
mod shutdown;
mod slots;

pub use dispatcher::DrainReport;
pub use poller::{BrokerPoller, PollerConfig};
pub use pool::{Worker, WorkerConfig, WorkerError};
pub use reporter::{ReportAction, ResultReporter, RESULT_STORE_RETRY_DELAY};
pub use shutdown::{DispatcherState, ShutdownCoordinator};
pub use slots::{Slot, SlotPool, SlotPoolError};
