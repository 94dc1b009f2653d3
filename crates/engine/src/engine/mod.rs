//! Task registration and inline execution
//!
//! This module provides:
//! - [`TaskRegistry`] - Name → handler + policy mapping, validated at registration
//! - [`EagerExecutor`] - Runs registered tasks inline, without broker or slot pool

mod eager;
mod registry;

pub use eager::EagerExecutor;
pub use registry::{RegisteredTask, RegistryError, TaskHandler, TaskPolicy, TaskRegistry};
