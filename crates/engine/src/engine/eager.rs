//! Inline task execution
//!
//! Executes tasks in the caller's task, bypassing broker, slot pool and
//! result backend. Useful for tests and for callers that need a result
//! synchronously.

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::TaskRegistry;
use crate::task::{TaskArgs, TaskContext, TaskError, TaskOutcome, TaskPayload};

/// Runs registered tasks inline
///
/// Retryable failures are retried immediately (no backoff delay) up to the
/// task's retry limit; the final failure is returned to the caller.
pub struct EagerExecutor<'a> {
    registry: &'a TaskRegistry,
}

impl<'a> EagerExecutor<'a> {
    /// Create an executor over `registry`
    pub fn new(registry: &'a TaskRegistry) -> Self {
        Self { registry }
    }

    /// Run task `name` with `args` to completion
    pub async fn apply(&self, name: &str, args: TaskArgs) -> Result<Value, TaskError> {
        let task = self
            .registry
            .resolve(name)
            .map_err(|e| TaskError::permanent(e.to_string()).with_type("NotRegistered"))?;

        let policy = task.policy();
        let payload = TaskPayload::json(&args);
        let task_id = Uuid::now_v7();
        let mut retries = 0;

        loop {
            let ctx = TaskContext::detached(task_id, name, retries, policy.retry.max_retries);

            match task.invoke(ctx, &payload).await {
                TaskOutcome::Success(value) => return Ok(value),
                TaskOutcome::PermanentFailure(error) => return Err(error),
                TaskOutcome::RetryableFailure { error, .. } => {
                    if !policy.retry.should_retry(error.error_type.as_deref())
                        || !policy.retry.has_retries_remaining(retries)
                    {
                        return Err(error);
                    }
                    retries += 1;
                    debug!(task = name, retries, error = %error, "retrying eager task");
                }
            }
        }
    }
}
