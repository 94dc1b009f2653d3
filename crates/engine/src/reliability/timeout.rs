//! Task execution timeouts

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Timeout-related errors
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TimeoutError {
    /// Task exceeded its execution timeout
    #[error("task execution timed out (limit {limit:?})")]
    Execution { limit: Duration },
}

impl TimeoutError {
    /// The limit that was exceeded
    pub fn limit(&self) -> Duration {
        match self {
            Self::Execution { limit } => *limit,
        }
    }
}

/// Run `future` for at most `limit`
///
/// A zero limit disables the timeout. The future is dropped when the
/// limit elapses; handlers that hold external resources must tolerate
/// being cancelled at any await point.
pub async fn run_with_timeout<F, T>(limit: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    if limit.is_zero() {
        return Ok(future.await);
    }

    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| TimeoutError::Execution { limit })
}
