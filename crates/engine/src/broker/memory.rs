//! In-memory implementation of BrokerClient

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::client::{BrokerClient, BrokerError, Requeue, MAX_SCHEDULE_DELAY};
use crate::task::{TaskMessage, DEFAULT_QUEUE};

/// Something that happened to a message, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Message handed to a consumer
    Fetched(Uuid),
    /// Message acknowledged
    Acked(Uuid),
    /// Message rejected
    Rejected { id: Uuid, requeue: Requeue },
    /// Visibility window elapsed without ack/reject; message is visible again
    Redelivered(Uuid),
}

struct InFlight {
    message: TaskMessage,
    deadline: Instant,
}

struct BrokerState {
    connected: bool,
    ready: HashMap<String, VecDeque<TaskMessage>>,
    delayed: Vec<(Instant, TaskMessage)>,
    in_flight: HashMap<Uuid, InFlight>,
    events: Vec<BrokerEvent>,
}

impl BrokerState {
    fn enqueue(&mut self, message: TaskMessage) {
        self.ready
            .entry(message.queue.clone())
            .or_default()
            .push_back(message);
    }

    fn promote_due(&mut self, now: Instant) {
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|(visible_at, _)| *visible_at <= now);
        self.delayed = pending;

        let mut due = due;
        due.sort_by_key(|(visible_at, _)| *visible_at);
        for (_, message) in due {
            self.enqueue(message);
        }

        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(flight) = self.in_flight.remove(&id) {
                debug!(%id, "visibility window elapsed, redelivering");
                self.events.push(BrokerEvent::Redelivered(id));
                self.enqueue(flight.message);
            }
        }
    }
}

/// In-process broker
///
/// Provides the same delivery semantics as a networked broker: messages
/// become visible at their eta, fetched messages are redelivered when the
/// visibility window elapses, rejected messages can be requeued with a
/// delay. All timing uses tokio's clock, so tests can run on paused time.
///
/// Every fetch, ack, reject and redelivery is recorded as a [`BrokerEvent`].
///
/// # Example
///
/// ```
/// use taskward_engine::{InMemoryBroker, TaskArgs, TaskMessage};
///
/// let broker = InMemoryBroker::new();
/// broker.publish(TaskMessage::new("debug_task", TaskArgs::new()));
/// assert_eq!(broker.pending_count(), 1);
/// ```
pub struct InMemoryBroker {
    queues: Vec<String>,
    visibility_timeout: Duration,
    state: Mutex<BrokerState>,
}

impl InMemoryBroker {
    /// Create a broker consuming the default queue
    pub fn new() -> Self {
        Self::with_queues(vec![DEFAULT_QUEUE.to_string()])
    }

    /// Create a broker consuming `queues`, in priority order
    pub fn with_queues(queues: Vec<String>) -> Self {
        Self {
            queues,
            visibility_timeout: Duration::from_secs(3600),
            state: Mutex::new(BrokerState {
                connected: true,
                ready: HashMap::new(),
                delayed: Vec::new(),
                in_flight: HashMap::new(),
                events: Vec::new(),
            }),
        }
    }

    /// Set how long a fetched message stays invisible before redelivery
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Publish a message; it becomes visible at its eta (or immediately)
    pub fn publish(&self, message: TaskMessage) {
        let mut state = self.state.lock();
        match message.delay_until_eta(Utc::now()) {
            Some(delay) => state.delayed.push((after(delay), message)),
            None => state.enqueue(message),
        }
    }

    /// Simulate losing or regaining the connection
    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    /// Messages waiting to be fetched (ready or delayed)
    pub fn pending_count(&self) -> usize {
        let state = self.state.lock();
        state.ready.values().map(VecDeque::len).sum::<usize>() + state.delayed.len()
    }

    /// Messages fetched but not yet acknowledged or rejected
    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// All recorded events, oldest first
    pub fn events(&self) -> Vec<BrokerEvent> {
        self.state.lock().events.clone()
    }

    /// Number of acks recorded for `id`
    pub fn ack_count(&self, id: Uuid) -> usize {
        self.count(|e| *e == BrokerEvent::Acked(id))
    }

    /// Number of rejects recorded for `id`
    pub fn reject_count(&self, id: Uuid) -> usize {
        self.count(|e| matches!(e, BrokerEvent::Rejected { id: rid, .. } if *rid == id))
    }

    /// Requeues recorded for `id`, as `(delay, retries)` pairs
    pub fn requeues(&self, id: Uuid) -> Vec<(Duration, u32)> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                BrokerEvent::Rejected {
                    id: rid,
                    requeue: Requeue::Yes { delay, retries },
                } if *rid == id => Some((*delay, *retries)),
                _ => None,
            })
            .collect()
    }

    fn count(&self, predicate: impl Fn(&BrokerEvent) -> bool) -> usize {
        self.state.lock().events.iter().filter(|e| predicate(e)).count()
    }

    fn ensure_connected(state: &BrokerState) -> Result<(), BrokerError> {
        if state.connected {
            Ok(())
        } else {
            Err(BrokerError::Transient("connection refused".into()))
        }
    }
}

/// The instant `delay` from now, clamped to the longest schedulable delay
fn after(delay: Duration) -> Instant {
    Instant::now() + delay.min(MAX_SCHEDULE_DELAY)
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    fn queues(&self) -> &[String] {
        &self.queues
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        Self::ensure_connected(&self.state.lock())
    }

    async fn fetch(&self) -> Result<Option<TaskMessage>, BrokerError> {
        let mut state = self.state.lock();
        Self::ensure_connected(&state)?;

        let now = Instant::now();
        state.promote_due(now);

        for queue in &self.queues {
            let next = state.ready.get_mut(queue).and_then(VecDeque::pop_front);
            if let Some(message) = next {
                state.events.push(BrokerEvent::Fetched(message.id));
                state.in_flight.insert(
                    message.id,
                    InFlight {
                        message: message.clone(),
                        deadline: now + self.visibility_timeout.min(MAX_SCHEDULE_DELAY),
                    },
                );
                return Ok(Some(message));
            }
        }

        Ok(None)
    }

    async fn ack(&self, id: Uuid) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        Self::ensure_connected(&state)?;

        state
            .in_flight
            .remove(&id)
            .ok_or(BrokerError::UnknownDelivery(id))?;
        state.events.push(BrokerEvent::Acked(id));
        Ok(())
    }

    async fn reject(&self, id: Uuid, requeue: Requeue) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        Self::ensure_connected(&state)?;

        let flight = state
            .in_flight
            .remove(&id)
            .ok_or(BrokerError::UnknownDelivery(id))?;
        state.events.push(BrokerEvent::Rejected { id, requeue });

        if let Requeue::Yes { delay, retries } = requeue {
            let message = TaskMessage {
                retries,
                ..flight.message
            };
            if delay.is_zero() {
                state.enqueue(message);
            } else {
                state.delayed.push((after(delay), message));
            }
        }
        Ok(())
    }
}
