//! ResultBackend trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::TaskError;

/// Error type for result backend operations
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// A result for this task id was already written
    #[error("result already stored for task: {0}")]
    AlreadyStored(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Terminal state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Handler returned a value
    Success,
    /// Task failed permanently or exhausted its retries
    Failure,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(Self::Success),
            "FAILURE" => Ok(Self::Failure),
            other => Err(BackendError::Serialization(format!(
                "unknown task state: {other}"
            ))),
        }
    }
}

/// Terminal result of a task, keyed by message id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub task_name: String,
    pub state: TaskState,
    /// Handler output (success only)
    pub result: Option<serde_json::Value>,
    /// Final error (failure only)
    pub error: Option<TaskError>,
    /// Retries performed before the terminal outcome
    pub retries: u32,
    pub date_done: DateTime<Utc>,
}

impl TaskResult {
    /// A successful result
    pub fn success(
        task_id: Uuid,
        task_name: impl Into<String>,
        retries: u32,
        value: serde_json::Value,
    ) -> Self {
        Self {
            task_id,
            task_name: task_name.into(),
            state: TaskState::Success,
            result: Some(value),
            error: None,
            retries,
            date_done: Utc::now(),
        }
    }

    /// A failed result
    pub fn failure(
        task_id: Uuid,
        task_name: impl Into<String>,
        retries: u32,
        error: TaskError,
    ) -> Self {
        Self {
            task_id,
            task_name: task_name.into(),
            state: TaskState::Failure,
            result: None,
            error: Some(error),
            retries,
            date_done: Utc::now(),
        }
    }
}

/// Write-once store of terminal task results
///
/// Each task id is written at most once; a second write returns
/// [`BackendError::AlreadyStored`] and leaves the first result untouched.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Store a terminal result
    async fn store_result(&self, result: TaskResult) -> Result<(), BackendError>;

    /// Load the result of `task_id`, if any
    async fn get_result(&self, task_id: Uuid) -> Result<Option<TaskResult>, BackendError>;
}
