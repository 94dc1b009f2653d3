//! In-memory implementation of ResultBackend

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;

/// In-memory result backend
///
/// This is primarily for testing. It provides the same write-once
/// semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use taskward_engine::InMemoryResultBackend;
///
/// let backend = InMemoryResultBackend::new();
/// assert_eq!(backend.len(), 0);
/// ```
pub struct InMemoryResultBackend {
    results: RwLock<HashMap<Uuid, TaskResult>>,
}

impl InMemoryResultBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self {
            results: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored results
    pub fn len(&self) -> usize {
        self.results.read().len()
    }

    /// Whether no results are stored
    pub fn is_empty(&self) -> bool {
        self.results.read().is_empty()
    }

    /// Number of stored results in `state`
    pub fn count(&self, state: TaskState) -> usize {
        self.results
            .read()
            .values()
            .filter(|r| r.state == state)
            .count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.results.write().clear();
    }
}

impl Default for InMemoryResultBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultBackend for InMemoryResultBackend {
    async fn store_result(&self, result: TaskResult) -> Result<(), BackendError> {
        let mut results = self.results.write();
        if results.contains_key(&result.task_id) {
            return Err(BackendError::AlreadyStored(result.task_id));
        }
        results.insert(result.task_id, result);
        Ok(())
    }

    async fn get_result(&self, task_id: Uuid) -> Result<Option<TaskResult>, BackendError> {
        Ok(self.results.read().get(&task_id).cloned())
    }
}
