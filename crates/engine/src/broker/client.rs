//! BrokerClient trait definition

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::task::TaskMessage;

/// Longest delay a broker schedules; longer requeue delays and visibility
/// windows are clamped to it
pub const MAX_SCHEDULE_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Error type for broker operations
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Connection lost or broker unreachable; retry with backoff
    #[error("broker unavailable: {0}")]
    Transient(String),

    /// Ack/reject for a message that is not in flight on this connection
    #[error("message not in flight: {0}")]
    UnknownDelivery(Uuid),

    /// Broker-side failure that reconnecting will not fix
    #[error("broker error: {0}")]
    Backend(String),

    /// Stored message could not be decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BrokerError {
    /// Whether the error is a transport failure worth reconnecting for
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// What a rejected message should become
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Remove the message; it is never redelivered
    No,

    /// Return the message to its queue, visible again after `delay`,
    /// carrying `retries` as its retry count
    Yes { delay: Duration, retries: u32 },
}

impl Requeue {
    /// Redeliver immediately with an unchanged retry count
    pub fn immediately(retries: u32) -> Self {
        Self::Yes {
            delay: Duration::ZERO,
            retries,
        }
    }

    /// Whether the message goes back to the queue
    pub fn is_requeue(&self) -> bool {
        matches!(self, Self::Yes { .. })
    }
}

/// Transport-agnostic connection to a message broker
///
/// Delivery is at-least-once: a fetched message that is neither
/// acknowledged nor rejected within the broker's visibility window is
/// redelivered. The worker keeps no queue of its own and relies on this
/// for durability.
///
/// Implementations must be safe to call concurrently (fetch from the
/// dispatcher, ack/reject from executing tasks); transports that are not
/// must serialize access internally.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Queues this client consumes, in priority order
    fn queues(&self) -> &[String];

    /// Establish (or verify) the connection
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Fetch the next visible message, if any, without blocking for long
    async fn fetch(&self) -> Result<Option<TaskMessage>, BrokerError>;

    /// Acknowledge a fetched message; it will not be redelivered
    async fn ack(&self, id: Uuid) -> Result<(), BrokerError>;

    /// Reject a fetched message, optionally returning it to the queue
    async fn reject(&self, id: Uuid, requeue: Requeue) -> Result<(), BrokerError>;
}
