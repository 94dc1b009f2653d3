//! Handler failures and classified execution outcomes

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error returned by a task handler
///
/// Handlers classify their own failures: retryable errors are requeued
/// (bounded by the task's retry policy), non-retryable errors are recorded
/// as permanent failures immediately.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether this error is retryable
    pub retryable: bool,

    /// Explicit delay before redelivery, overriding the policy backoff
    #[serde(default, with = "option_duration_millis")]
    pub countdown: Option<Duration>,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl TaskError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            countdown: None,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            countdown: None,
            details: None,
        }
    }

    /// Execution exceeded the task's timeout
    pub fn timeout(limit: Duration) -> Self {
        Self::retryable(format!("task execution timed out after {limit:?}")).with_type("Timeout")
    }

    /// Handler panicked
    pub fn panicked(message: impl Into<String>) -> Self {
        Self::retryable(message).with_type("Panic")
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Redeliver after `countdown` instead of the policy backoff
    pub fn with_countdown(mut self, countdown: Duration) -> Self {
        self.countdown = Some(countdown);
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(error_type) => write!(f, "{}: {}", error_type, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for TaskError {}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

impl From<super::PayloadError> for TaskError {
    fn from(err: super::PayloadError) -> Self {
        Self::permanent(err.to_string()).with_type("InvalidPayload")
    }
}

/// Classified outcome of one task execution
///
/// Produced by handler invocation and inspected by the result reporter.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Handler returned a value
    Success(serde_json::Value),

    /// Handler failed in a way that redelivery may fix
    RetryableFailure {
        error: TaskError,
        /// Explicit redelivery delay; `None` uses the policy backoff
        delay: Option<Duration>,
    },

    /// Handler failed in a way that redelivery cannot fix
    PermanentFailure(TaskError),
}

impl TaskOutcome {
    /// Whether the outcome is a success
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<Result<serde_json::Value, TaskError>> for TaskOutcome {
    fn from(result: Result<serde_json::Value, TaskError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(error) if error.retryable => Self::RetryableFailure {
                delay: error.countdown,
                error,
            },
            Err(error) => Self::PermanentFailure(error),
        }
    }
}

/// Serde support for Option<Duration> as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => d.as_millis().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
