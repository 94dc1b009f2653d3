//! Result reporting
//!
//! Turns an execution outcome into exactly one broker reply (ack or
//! reject) and, for terminal outcomes, exactly one result record:
//!
//! | Outcome                                 | Result backend | Broker                        |
//! |-----------------------------------------|----------------|-------------------------------|
//! | Success                                 | success        | ack                           |
//! | Retryable, retries remaining            | (none)         | reject, requeue after backoff |
//! | Retryable, exhausted or non-retryable   | failure        | ack                           |
//! | Permanent                               | failure        | ack                           |
//! | Unknown task                            | failure        | reject, no requeue            |
//! | Expired                                 | failure        | ack                           |
//!
//! A terminal result the backend refuses to store is never acked past:
//! the message is requeued with its retry count unchanged and the outcome
//! is recomputed on the next delivery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::backend::{BackendError, ResultBackend, TaskResult};
use crate::broker::{BrokerClient, BrokerError, Requeue};
use crate::engine::{RegistryError, TaskPolicy};
use crate::task::{ExecutionRecord, TaskError, TaskMessage, TaskOutcome};

/// Redelivery delay after the result backend failed a write
pub const RESULT_STORE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// What the reporter did with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportAction {
    /// Result recorded, message acknowledged
    Acked,
    /// Message returned to the broker for another attempt
    Requeued { delay: Duration, retries: u32 },
    /// Message removed without redelivery
    Rejected,
    /// Reporter sealed; message left for broker redelivery
    Dropped,
}

/// Writes results and replies to the broker
pub struct ResultReporter {
    broker: Arc<dyn BrokerClient>,
    backend: Arc<dyn ResultBackend>,
    sealed: AtomicBool,
}

impl ResultReporter {
    /// Create a reporter
    pub fn new(broker: Arc<dyn BrokerClient>, backend: Arc<dyn ResultBackend>) -> Self {
        Self {
            broker,
            backend,
            sealed: AtomicBool::new(false),
        }
    }

    /// Stop reporting
    ///
    /// Executions abandoned by the drain must leave their messages
    /// unacknowledged; once sealed every report is dropped.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// Whether the reporter is sealed
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Report the outcome of one execution
    #[instrument(
        skip(self, record, policy, outcome),
        fields(task_id = %record.task_id(), task = %record.task_name(), retries = record.retries())
    )]
    pub async fn report(
        &self,
        record: &ExecutionRecord,
        policy: &TaskPolicy,
        outcome: TaskOutcome,
    ) -> Result<ReportAction, BrokerError> {
        if self.is_sealed() {
            warn!("execution finished after drain timeout; leaving message for redelivery");
            return Ok(ReportAction::Dropped);
        }

        let retries = record.retries();
        let elapsed_ms = record.elapsed().as_millis();

        let error = match outcome {
            TaskOutcome::Success(value) => {
                info!(elapsed_ms, "task succeeded");
                let result =
                    TaskResult::success(record.task_id(), record.task_name(), retries, value);
                if self.store(result).await.is_err() {
                    return self.requeue_unstored(record.task_id(), retries).await;
                }
                return self.ack(record.task_id()).await;
            }
            TaskOutcome::RetryableFailure { error, delay } => {
                let retry = &policy.retry;
                if retry.should_retry(error.error_type.as_deref())
                    && retry.has_retries_remaining(retries)
                {
                    let delay = delay.unwrap_or_else(|| retry.delay_for_retry(retries));
                    warn!(
                        error = %error,
                        delay_ms = delay.as_millis(),
                        attempt = retries + 1,
                        max_retries = retry.max_retries,
                        "task failed, scheduling retry"
                    );
                    return self.requeue(record.task_id(), delay, retries + 1).await;
                }
                error
            }
            TaskOutcome::PermanentFailure(error) => error,
        };

        error!(error = %error, elapsed_ms, "task failed permanently");
        let result = TaskResult::failure(record.task_id(), record.task_name(), retries, error);
        if self.store(result).await.is_err() {
            return self.requeue_unstored(record.task_id(), retries).await;
        }
        self.ack(record.task_id()).await
    }

    /// Report a message naming a task nobody registered
    #[instrument(skip(self, message, reason), fields(task_id = %message.id, task = %message.task))]
    pub async fn report_unknown(
        &self,
        message: &TaskMessage,
        reason: &RegistryError,
    ) -> Result<ReportAction, BrokerError> {
        error!(error = %reason, "received unregistered task, discarding");
        let error = TaskError::permanent(reason.to_string()).with_type("NotRegistered");
        let stored = self
            .store(TaskResult::failure(
                message.id,
                &message.task,
                message.retries,
                error,
            ))
            .await;
        if stored.is_err() {
            return self.requeue_unstored(message.id, message.retries).await;
        }

        if self.is_sealed() {
            return Ok(ReportAction::Dropped);
        }
        self.broker.reject(message.id, Requeue::No).await?;
        Ok(ReportAction::Rejected)
    }

    /// Report a message fetched after its expiry time
    #[instrument(skip(self, message), fields(task_id = %message.id, task = %message.task))]
    pub async fn report_expired(&self, message: &TaskMessage) -> Result<ReportAction, BrokerError> {
        warn!(expires = ?message.expires, "task expired before execution");
        let error = TaskError::permanent("task expired before execution").with_type("Expired");
        let stored = self
            .store(TaskResult::failure(
                message.id,
                &message.task,
                message.retries,
                error,
            ))
            .await;
        if stored.is_err() {
            return self.requeue_unstored(message.id, message.retries).await;
        }
        self.ack(message.id).await
    }

    /// Hand a message that was never started back to the broker
    ///
    /// The retry count is unchanged: no attempt was made.
    pub async fn release_unstarted(
        &self,
        message: &TaskMessage,
        delay: Duration,
    ) -> Result<ReportAction, BrokerError> {
        debug!(task_id = %message.id, delay_ms = delay.as_millis(), "returning unstarted message");
        self.requeue(message.id, delay, message.retries).await
    }

    async fn requeue(
        &self,
        id: Uuid,
        delay: Duration,
        retries: u32,
    ) -> Result<ReportAction, BrokerError> {
        if self.is_sealed() {
            return Ok(ReportAction::Dropped);
        }
        self.broker
            .reject(id, Requeue::Yes { delay, retries })
            .await?;
        Ok(ReportAction::Requeued { delay, retries })
    }

    async fn requeue_unstored(&self, id: Uuid, retries: u32) -> Result<ReportAction, BrokerError> {
        warn!(
            task_id = %id,
            delay_ms = RESULT_STORE_RETRY_DELAY.as_millis(),
            "result not recorded; returning message for redelivery"
        );
        self.requeue(id, RESULT_STORE_RETRY_DELAY, retries).await
    }

    async fn ack(&self, id: Uuid) -> Result<ReportAction, BrokerError> {
        if self.is_sealed() {
            return Ok(ReportAction::Dropped);
        }
        self.broker.ack(id).await?;
        Ok(ReportAction::Acked)
    }

    /// Write a terminal result
    ///
    /// A result already recorded by an earlier delivery counts as stored.
    async fn store(&self, result: TaskResult) -> Result<(), BackendError> {
        let task_id = result.task_id;
        match self.backend.store_result(result).await {
            Ok(()) => Ok(()),
            Err(BackendError::AlreadyStored(_)) => {
                debug!(%task_id, "result already recorded by an earlier delivery");
                Ok(())
            }
            Err(e) => {
                error!(%task_id, error = %e, "failed to store task result");
                Err(e)
            }
        }
    }
}
