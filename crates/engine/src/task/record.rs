//! Execution records

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::TaskMessage;

/// Ephemeral state of one in-flight execution
///
/// Created when a slot is acquired for a message, dropped once the
/// outcome has been reported and the slot released.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    /// The message being executed
    pub message: TaskMessage,

    /// Index of the slot running the execution
    pub slot: usize,

    /// When execution started
    pub started_at: DateTime<Utc>,

    started: tokio::time::Instant,
}

impl ExecutionRecord {
    /// Start a record for `message` running in `slot`
    pub fn start(message: TaskMessage, slot: usize) -> Self {
        Self {
            message,
            slot,
            started_at: Utc::now(),
            started: tokio::time::Instant::now(),
        }
    }

    /// Message id
    pub fn task_id(&self) -> Uuid {
        self.message.id
    }

    /// Task name
    pub fn task_name(&self) -> &str {
        &self.message.task
    }

    /// Retries performed before this execution
    pub fn retries(&self) -> u32 {
        self.message.retries
    }

    /// Time since the execution started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
