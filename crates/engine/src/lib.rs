//! # Taskward Engine
//!
//! The core of a broker-fed task worker: pulls task messages from a broker,
//! executes them with bounded parallelism, and reports outcomes back to the
//! broker and a result backend.
//!
//! ## Features
//!
//! - **At-least-once delivery**: messages are acknowledged only after their outcome is known;
//!   anything left un-acknowledged is redelivered by the broker
//! - **Bounded concurrency**: a fixed, FIFO-fair pool of execution slots back-pressures fetching
//! - **Retries**: per-task policies with capped exponential backoff
//! - **Graceful shutdown**: stop fetching, drain in-flight work within a deadline, abandon the rest
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   fetch    ┌──────────────────────────────────────────┐
//! │ BrokerClient │ ─────────► │               Dispatcher                 │
//! │ (memory, pg) │ ◄───────── │  (resolve → acquire slot → spawn)        │
//! └──────────────┘ ack/reject └──────────────────────────────────────────┘
//!        ▲                           │                     │
//!        │                           ▼                     ▼
//!        │                  ┌────────────────┐    ┌──────────────────┐
//!        │                  │  TaskRegistry  │    │     SlotPool     │
//!        │                  └────────────────┘    │ [1] [2] [3] [4]  │
//!        │                                        └──────────────────┘
//!        │                                                 │
//!        │                  ┌────────────────┐             ▼
//!        └───────────────── │ ResultReporter │ ◄──── task handler
//!                           └────────────────┘
//!                                   │
//!                                   ▼
//!                           ┌────────────────┐
//!                           │ ResultBackend  │
//!                           └────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use taskward_engine::prelude::*;
//!
//! let mut registry = TaskRegistry::new();
//! registry.register("add", TaskPolicy::default(), |_ctx, args| async move {
//!     let a = args.args[0].as_i64().unwrap_or(0);
//!     let b = args.args[1].as_i64().unwrap_or(0);
//!     Ok(serde_json::json!(a + b))
//! })?;
//!
//! let broker = Arc::new(InMemoryBroker::new());
//! let backend = Arc::new(InMemoryResultBackend::new());
//! let shutdown = ShutdownCoordinator::new();
//!
//! let worker = Worker::new(WorkerConfig::default(), broker, backend, registry, shutdown.clone());
//! let report = worker.run().await?;
//! ```

pub mod backend;
pub mod broker;
pub mod engine;
pub mod reliability;
pub mod task;
pub mod worker;

mod duration_millis;

/// Prelude for common imports
pub mod prelude {
    pub use crate::backend::{
        BackendError, InMemoryResultBackend, PostgresResultBackend, ResultBackend, TaskResult,
        TaskState,
    };
    pub use crate::broker::{
        BrokerClient, BrokerError, InMemoryBroker, PostgresBroker, Requeue,
    };
    pub use crate::engine::{EagerExecutor, RegistryError, TaskPolicy, TaskRegistry};
    pub use crate::reliability::RetryPolicy;
    pub use crate::task::{
        Task, TaskArgs, TaskContext, TaskError, TaskMessage, TaskOutcome, TaskPayload,
    };
    pub use crate::worker::{
        DispatcherState, DrainReport, PollerConfig, ShutdownCoordinator, SlotPool, Worker,
        WorkerConfig, WorkerError,
    };
}

// Re-export key types at crate root
pub use backend::{InMemoryResultBackend, PostgresResultBackend, ResultBackend, TaskResult};
pub use broker::{BrokerClient, BrokerError, InMemoryBroker, PostgresBroker, Requeue};
pub use engine::{EagerExecutor, RegistryError, TaskPolicy, TaskRegistry};
pub use reliability::RetryPolicy;
pub use task::{Task, TaskArgs, TaskContext, TaskError, TaskMessage, TaskOutcome, TaskPayload};
pub use worker::{DrainReport, ShutdownCoordinator, Worker, WorkerConfig, WorkerError};
