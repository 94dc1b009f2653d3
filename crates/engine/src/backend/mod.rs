//! Result backends
//!
//! This module provides:
//! - [`ResultBackend`] trait: write-once storage of terminal task results
//! - [`InMemoryResultBackend`] for tests and `memory://` deployments
//! - [`PostgresResultBackend`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryResultBackend;
pub use postgres::PostgresResultBackend;
pub use store::{BackendError, ResultBackend, TaskResult, TaskState};
