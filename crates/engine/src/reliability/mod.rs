//! Reliability patterns for task execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with capped exponential backoff
//! - [`run_with_timeout`] - Per-task execution timeout enforcement

mod retry;
mod timeout;

pub use retry::RetryPolicy;
pub use timeout::{run_with_timeout, TimeoutError};
