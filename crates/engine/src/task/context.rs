//! Task execution context

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Context provided to task handlers during execution
///
/// The context provides:
/// - Information about the message being executed and its retry history
/// - The execution slot the task runs in
/// - Cooperative shutdown detection
///
/// # Example
///
/// ```ignore
/// registry.register("import_rows", policy, |ctx, args| async move {
///     for row in rows(&args) {
///         if ctx.is_shutting_down() {
///             // Let the broker hand the rest to another worker
///             return Err(TaskError::retryable("worker shutting down"));
///         }
///         import(row).await?;
///     }
///     Ok(json!({"imported": true}))
/// });
/// ```
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Message id (also the result key)
    pub task_id: Uuid,

    /// Registered task name
    pub task_name: String,

    /// Retries performed before this attempt
    pub retries: u32,

    /// Maximum retries allowed by the task's policy
    pub max_retries: u32,

    /// Index of the execution slot running the task
    pub slot: usize,

    /// When this attempt started
    pub started_at: DateTime<Utc>,

    shutting_down: Arc<AtomicBool>,
}

impl TaskContext {
    /// Create a new task context
    pub fn new(
        task_id: Uuid,
        task_name: impl Into<String>,
        retries: u32,
        max_retries: u32,
        slot: usize,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        Self {
            task_id,
            task_name: task_name.into(),
            retries,
            max_retries,
            slot,
            started_at: Utc::now(),
            shutting_down,
        }
    }

    /// Create a context detached from any worker (eager execution, tests)
    pub fn detached(task_id: Uuid, task_name: impl Into<String>, retries: u32, max_retries: u32) -> Self {
        Self::new(
            task_id,
            task_name,
            retries,
            max_retries,
            0,
            Arc::new(AtomicBool::new(false)),
        )
    }

    /// Whether the worker has started shutting down
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Whether this attempt is the last one the policy allows
    pub fn is_last_attempt(&self) -> bool {
        self.retries >= self.max_retries
    }
}
