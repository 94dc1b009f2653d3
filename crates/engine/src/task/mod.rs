//! Task primitives
//!
//! This module provides:
//! - [`TaskMessage`] - An immutable unit of work as delivered by the broker
//! - [`TaskError`] / [`TaskOutcome`] - Handler failures and the classified result of an execution
//! - [`TaskContext`] - Execution context handed to handlers
//! - [`Task`] - Typed task definition
//! - [`ExecutionRecord`] - State of one in-flight execution

mod context;
mod definition;
mod error;
mod message;
mod record;

pub use context::TaskContext;
pub use definition::Task;
pub use error::{TaskError, TaskOutcome};
pub use message::{
    PayloadError, TaskArgs, TaskMessage, TaskPayload, CONTENT_TYPE_JSON, DEFAULT_QUEUE,
};
pub use record::ExecutionRecord;
