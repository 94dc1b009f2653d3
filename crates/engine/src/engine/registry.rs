//! Task registry for type-erased task dispatch
//!
//! The registry maps task names to handlers and their execution policy.
//! It is populated once at startup and shared read-only with the
//! dispatcher afterwards.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reliability::{run_with_timeout, RetryPolicy};
use crate::task::{Task, TaskArgs, TaskContext, TaskError, TaskOutcome, TaskPayload};

/// Execution policy of a registered task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskPolicy {
    /// Retry behaviour for retryable failures and timeouts
    pub retry: RetryPolicy,

    /// Maximum execution time of one attempt (zero disables the limit)
    #[serde(with = "crate::duration_millis")]
    pub timeout: Duration,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(300),
        }
    }
}

impl TaskPolicy {
    /// Create a policy with default retry behaviour and timeout
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the maximum number of retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    /// Set the per-attempt execution timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Type-erased task handler
pub type TaskHandler =
    Arc<dyn Fn(TaskContext, TaskArgs) -> BoxFuture<'static, Result<Value, TaskError>> + Send + Sync>;

/// A task as resolved from the registry: handler plus policy
pub struct RegisteredTask {
    name: String,
    policy: TaskPolicy,
    handler: TaskHandler,
}

impl RegisteredTask {
    /// Task name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execution policy
    pub fn policy(&self) -> &TaskPolicy {
        &self.policy
    }

    /// Decode `payload` and run the handler under the policy timeout
    ///
    /// Undecodable payloads are permanent failures. Timeouts and panics are
    /// retryable failures.
    pub async fn invoke(&self, ctx: TaskContext, payload: &TaskPayload) -> TaskOutcome {
        let args = match payload.decode_args() {
            Ok(args) => args,
            Err(e) => return TaskOutcome::PermanentFailure(e.into()),
        };

        // The handler call itself runs inside catch_unwind, not only its future
        let execution =
            AssertUnwindSafe(async move { (self.handler)(ctx, args).await }).catch_unwind();

        match run_with_timeout(self.policy.timeout, execution).await {
            Ok(Ok(result)) => TaskOutcome::from(result),
            Ok(Err(panic)) => TaskOutcome::RetryableFailure {
                error: TaskError::panicked(panic_message(panic.as_ref())),
                delay: None,
            },
            Err(timeout) => TaskOutcome::RetryableFailure {
                error: TaskError::timeout(timeout.limit()),
                delay: None,
            },
        }
    }
}

impl fmt::Debug for RegisteredTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredTask")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        "task panicked".to_string()
    }
}

/// Registry of task handlers
///
/// # Example
///
/// ```ignore
/// let mut registry = TaskRegistry::new();
///
/// registry.register("send_sms", TaskPolicy::default().with_max_retries(5), |ctx, args| async move {
///     // Send the message...
///     Ok(json!({"sent": true}))
/// })?;
///
/// registry.register_task(GeneratePdf)?;
/// ```
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<RegisteredTask>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Register a handler closure under `name`
    pub fn register<F, Fut>(
        &mut self,
        name: &str,
        policy: TaskPolicy,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(TaskContext, TaskArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::InvalidName);
        }
        if self.tasks.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        policy
            .retry
            .validate()
            .map_err(|reason| RegistryError::InvalidPolicy {
                task: name.to_string(),
                reason,
            })?;

        let handler: TaskHandler = Arc::new(move |ctx, args| handler(ctx, args).boxed());
        self.tasks.insert(
            name.to_string(),
            Arc::new(RegisteredTask {
                name: name.to_string(),
                policy,
                handler,
            }),
        );
        Ok(())
    }

    /// Register a typed task
    pub fn register_task<T: Task>(&mut self, task: T) -> Result<(), RegistryError> {
        let policy = task.policy();
        let task = Arc::new(task);
        self.register(T::NAME, policy, move |ctx, args| {
            run_typed(Arc::clone(&task), ctx, args)
        })
    }

    /// Resolve a task by name
    pub fn resolve(&self, name: &str) -> Result<Arc<RegisteredTask>, RegistryError> {
        self.tasks
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Check if a task is registered
    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Get the number of registered tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Get all registered task names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

async fn run_typed<T: Task>(
    task: Arc<T>,
    ctx: TaskContext,
    args: TaskArgs,
) -> Result<Value, TaskError> {
    let input: T::Input = args.decode()?;
    let output = task.run(&ctx, input).await?;
    serde_json::to_value(output)
        .map_err(|e| TaskError::permanent(e.to_string()).with_type("SerializationError"))
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Task name not registered
    #[error("unknown task: {0}")]
    NotFound(String),

    /// Task name already registered
    #[error("task already registered: {0}")]
    Duplicate(String),

    /// Empty task name
    #[error("task name must not be empty")]
    InvalidName,

    /// Policy failed validation
    #[error("invalid policy for task {task}: {reason}")]
    InvalidPolicy { task: String, reason: String },
}
