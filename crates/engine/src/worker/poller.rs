//! Broker polling with adaptive backoff
//!
//! Idle polls back off exponentially and reset as soon as a message
//! arrives. Transport errors never reach the dispatcher: the poller backs
//! off on a separate reconnect schedule and re-establishes the connection.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::broker::BrokerClient;
use crate::task::TaskMessage;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when messages are flowing)
    #[serde(with = "crate::duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "crate::duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no message was found
    pub backoff_multiplier: f64,

    /// First delay before reconnecting after a transport error
    #[serde(with = "crate::duration_millis")]
    pub reconnect_initial: Duration,

    /// Maximum delay between reconnect attempts
    #[serde(with = "crate::duration_millis")]
    pub reconnect_max: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            backoff_multiplier: 1.5,
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum poll interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum poll interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set the reconnect backoff bounds
    pub fn with_reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial = initial;
        self.reconnect_max = max.max(initial);
        self
    }
}

/// Pulls messages from the broker for the dispatcher
pub struct BrokerPoller {
    broker: Arc<dyn BrokerClient>,
    config: PollerConfig,
    current_interval: Duration,
    reconnect_interval: Duration,
    disconnected: bool,
    shutdown_rx: watch::Receiver<bool>,
}

impl BrokerPoller {
    /// Create a new poller; `shutdown_rx` flips to `true` to stop polling
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            broker,
            current_interval: config.min_interval,
            reconnect_interval: config.reconnect_initial,
            config,
            disconnected: false,
            shutdown_rx,
        }
    }

    /// Wait for the next message
    ///
    /// Returns `None` once shutdown is requested. A fetch already sent to
    /// the broker is allowed to finish so a claimed message is never lost
    /// in flight; only the waits between fetches are cut short.
    #[instrument(skip(self))]
    pub async fn next(&mut self) -> Option<TaskMessage> {
        loop {
            if self.is_shutdown() {
                return None;
            }

            match self.broker.fetch().await {
                Ok(Some(message)) => {
                    self.reset_backoff();
                    self.mark_connected();
                    return Some(message);
                }
                Ok(None) => {
                    self.mark_connected();
                    self.increase_backoff();
                    trace!(
                        interval_ms = self.current_interval.as_millis(),
                        "No messages, backing off"
                    );
                    if self.wait(self.current_interval).await {
                        return None;
                    }
                }
                Err(e) if e.is_transient() => {
                    if !self.disconnected {
                        warn!(error = %e, "Lost broker connection");
                        self.disconnected = true;
                    }
                    if self.reconnect().await {
                        return None;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Fetch failed");
                    if self.wait(self.config.max_interval).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Get the current idle poll interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Wait out the reconnect backoff, then try to reconnect
    ///
    /// Returns `true` if shutdown was requested while waiting.
    async fn reconnect(&mut self) -> bool {
        let delay = self.reconnect_interval;
        debug!(delay_ms = delay.as_millis(), "Reconnecting to broker");
        if self.wait(delay).await {
            return true;
        }

        match self.broker.connect().await {
            Ok(()) => self.mark_connected(),
            Err(e) => {
                debug!(error = %e, "Reconnect failed");
                self.increase_reconnect_backoff();
            }
        }
        false
    }

    /// Sleep for `duration`, returning `true` early if shutdown is signaled
    async fn wait(&mut self, duration: Duration) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = shutdown_rx.wait_for(|stop| *stop) => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }

    fn mark_connected(&mut self) {
        if self.disconnected {
            info!("Broker connection restored");
            self.disconnected = false;
        }
        self.reconnect_interval = self.config.reconnect_initial;
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let max = self.config.max_interval;
        self.current_interval = Duration::try_from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        )
        .map_or(max, |interval| interval.min(max));
    }

    fn increase_reconnect_backoff(&mut self) {
        self.reconnect_interval = self
            .reconnect_interval
            .saturating_mul(2)
            .min(self.config.reconnect_max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, InMemoryBroker};
    use crate::task::TaskArgs;

    fn poller(broker: Arc<InMemoryBroker>) -> (BrokerPoller, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (BrokerPoller::new(broker, PollerConfig::default(), rx), tx)
    }

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.min_interval, Duration::from_millis(100));
        assert_eq!(config.max_interval, Duration::from_secs(2));
        assert_eq!(config.backoff_multiplier, 1.5);
        assert_eq!(config.reconnect_initial, Duration::from_millis(500));
    }

    #[test]
    fn test_config_builder() {
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(50))
            .with_max_interval(Duration::from_secs(10))
            .with_backoff_multiplier(0.5)
            .with_reconnect_backoff(Duration::from_secs(2), Duration::from_secs(1));

        assert_eq!(config.min_interval, Duration::from_millis(50));
        assert_eq!(config.max_interval, Duration::from_secs(10));
        assert_eq!(config.backoff_multiplier, 1.0);
        assert_eq!(config.reconnect_max, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_published_message() {
        let broker = Arc::new(InMemoryBroker::new());
        let message = TaskMessage::new("a", TaskArgs::new());
        let id = message.id;
        broker.publish(message);

        let (mut poller, _tx) = poller(Arc::clone(&broker));
        assert_eq!(poller.next().await.unwrap().id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_backoff_is_capped() {
        let broker = Arc::new(InMemoryBroker::new());
        let (mut poller, tx) = poller(Arc::clone(&broker));

        let handle = tokio::spawn(async move {
            let message = poller.next().await;
            (message.is_some(), poller.current_interval())
        });

        tokio::time::sleep(Duration::from_secs(60)).await;
        tx.send_replace(true);

        let (got_message, interval) = handle.await.unwrap();
        assert!(!got_message);
        assert_eq!(interval, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_survives_transient_errors() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_connected(false);
        let message = TaskMessage::new("a", TaskArgs::new());
        let id = message.id;
        broker.publish(message);

        let (mut poller, _tx) = poller(Arc::clone(&broker));
        let handle = tokio::spawn(async move { poller.next().await.map(|m| m.id) });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!handle.is_finished());
        assert!(matches!(
            broker.fetch().await,
            Err(BrokerError::Transient(_))
        ));

        broker.set_connected(true);
        assert_eq!(handle.await.unwrap(), Some(id));
    }

    #[test]
    fn test_backoff_saturates_at_unbounded_caps() {
        let (_tx, rx) = watch::channel(false);
        let config = PollerConfig::new()
            .with_max_interval(Duration::MAX)
            .with_reconnect_backoff(Duration::from_secs(1), Duration::MAX);
        let mut poller = BrokerPoller::new(Arc::new(InMemoryBroker::new()), config, rx);

        poller.current_interval = Duration::MAX;
        poller.increase_backoff();
        assert_eq!(poller.current_interval(), Duration::MAX);

        poller.reconnect_interval = Duration::MAX / 2;
        for _ in 0..3 {
            poller.increase_reconnect_backoff();
        }
        assert_eq!(poller.reconnect_interval, Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_wait() {
        let broker = Arc::new(InMemoryBroker::new());
        let (mut poller, tx) = poller(broker);
        tx.send_replace(true);
        assert!(poller.next().await.is_none());
        assert!(poller.is_shutdown());
    }
}
