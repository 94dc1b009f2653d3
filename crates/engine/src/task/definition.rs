//! Typed task definitions

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use super::{TaskContext, TaskError};
use crate::engine::TaskPolicy;

/// A named unit of work with typed input and output
///
/// Registered with [`TaskRegistry::register_task`](crate::engine::TaskRegistry::register_task).
/// The input is decoded from the message's arguments, the output is
/// serialized into the task's result.
///
/// # Example
///
/// ```ignore
/// struct SendMessage;
///
/// #[async_trait]
/// impl Task for SendMessage {
///     const NAME: &'static str = "send_message";
///     type Input = SendMessageInput;
///     type Output = SendMessageOutput;
///
///     async fn run(&self, ctx: &TaskContext, input: Self::Input) -> Result<Self::Output, TaskError> {
///         // Deliver the message...
///         Ok(SendMessageOutput { delivered: true })
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Name the task is registered and dispatched under
    const NAME: &'static str;

    /// Input decoded from the message arguments
    type Input: DeserializeOwned + Send;

    /// Output stored as the task's result
    type Output: Serialize + Send;

    /// Execution policy for this task
    fn policy(&self) -> TaskPolicy {
        TaskPolicy::default()
    }

    /// Execute the task
    ///
    /// # Errors
    ///
    /// Return `TaskError::retryable()` for transient failures that should be retried.
    /// Return `TaskError::permanent()` for failures that redelivery cannot fix.
    async fn run(&self, ctx: &TaskContext, input: Self::Input) -> Result<Self::Output, TaskError>;
}
