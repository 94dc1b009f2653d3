//! End-to-end worker scenarios against the in-memory broker and backend
//!
//! All tests run on paused tokio time, so backoff delays and drain
//! timeouts are virtual.
//!
//! Run with: cargo test -p taskward-engine --test worker_scenarios

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use taskward_engine::backend::TaskState;
use taskward_engine::broker::BrokerEvent;
use taskward_engine::prelude::*;
use taskward_engine::worker::RESULT_STORE_RETRY_DELAY;

// ============================================
// Harness
// ============================================

struct Harness {
    broker: Arc<InMemoryBroker>,
    backend: Arc<InMemoryResultBackend>,
    shutdown: ShutdownCoordinator,
}

impl Harness {
    fn new() -> Self {
        Self::with_broker(InMemoryBroker::new())
    }

    fn with_broker(broker: InMemoryBroker) -> Self {
        Self {
            broker: Arc::new(broker),
            backend: Arc::new(InMemoryResultBackend::new()),
            shutdown: ShutdownCoordinator::new(),
        }
    }

    fn config(concurrency: usize, drain_timeout: Duration) -> WorkerConfig {
        WorkerConfig::default()
            .with_worker_id("test-worker")
            .with_concurrency(concurrency)
            .with_drain_timeout(drain_timeout)
            .with_poller(
                PollerConfig::new()
                    .with_min_interval(Duration::from_millis(10))
                    .with_max_interval(Duration::from_millis(50))
                    .with_reconnect_backoff(Duration::from_millis(100), Duration::from_secs(1)),
            )
    }

    fn start(
        &self,
        config: WorkerConfig,
        registry: TaskRegistry,
    ) -> JoinHandle<Result<DrainReport, WorkerError>> {
        let worker = Worker::new(
            config,
            self.broker.clone(),
            self.backend.clone(),
            registry,
            self.shutdown.clone(),
        );
        tokio::spawn(worker.run())
    }

    fn publish(&self, task: &str) -> Uuid {
        let message = TaskMessage::new(task, TaskArgs::new());
        let id = message.id;
        self.broker.publish(message);
        id
    }

    async fn stop(&self, handle: JoinHandle<Result<DrainReport, WorkerError>>) -> DrainReport {
        self.shutdown.signal();
        handle.await.unwrap().unwrap()
    }

    /// Every fetch of `id` was answered by exactly one ack or reject
    fn assert_answered(&self, id: Uuid) {
        let events = self.broker.events();
        let fetched = events
            .iter()
            .filter(|e| **e == BrokerEvent::Fetched(id))
            .count();
        let answered = self.broker.ack_count(id) + self.broker.reject_count(id);
        assert!(fetched > 0, "message {id} was never fetched");
        assert_eq!(fetched, answered, "message {id}: {events:?}");
    }
}

/// Poll `condition` on virtual time until it holds or `limit` elapses
async fn eventually(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// A task that sleeps for `duration` and tracks how many run at once
fn sleeper_registry(duration: Duration, max_retries: u32) -> (TaskRegistry, Arc<AtomicUsize>) {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (running_in, peak_in) = (Arc::clone(&running), Arc::clone(&peak));

    let mut registry = TaskRegistry::new();
    registry
        .register(
            "sleep",
            TaskPolicy::default().with_max_retries(max_retries),
            move |ctx, _args| {
                let running = Arc::clone(&running_in);
                let peak = Arc::clone(&peak_in);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(duration).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!({ "slot": ctx.slot }))
                }
            },
        )
        .unwrap();
    (registry, peak)
}

// ============================================
// Scenarios
// ============================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_ten_tasks_on_four_slots() {
    let h = Harness::new();
    let (registry, peak) = sleeper_registry(Duration::from_millis(500), 0);
    let ids: Vec<_> = (0..10).map(|_| h.publish("sleep")).collect();

    let handle = h.start(Harness::config(4, Duration::from_secs(5)), registry);

    let backend = h.backend.clone();
    assert!(eventually(Duration::from_secs(30), || backend.len() == 10).await);
    assert_eq!(h.stop(handle).await, DrainReport::Completed);

    assert_eq!(peak.load(Ordering::SeqCst), 4);
    for id in ids {
        assert_eq!(h.broker.ack_count(id), 1);
        h.assert_answered(id);
    }
    assert_eq!(h.backend.count(TaskState::Success), 10);
    assert_eq!(h.broker.in_flight_count(), 0);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_worker_consumes_the_broker_queues() {
    let h = Harness::with_broker(InMemoryBroker::with_queues(vec!["high".into()]));
    assert_eq!(h.broker.queues(), ["high".to_string()]);
    let (registry, _) = sleeper_registry(Duration::from_millis(10), 0);

    let high = TaskMessage::new("sleep", TaskArgs::new()).with_queue("high");
    let high_id = high.id;
    h.broker.publish(high);
    let other_id = h.publish("sleep");

    let handle = h.start(Harness::config(2, Duration::from_secs(5)), registry);
    let broker = h.broker.clone();
    assert!(eventually(Duration::from_secs(5), || broker.ack_count(high_id) == 1).await);
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.stop(handle).await;

    assert!(!h.broker.events().contains(&BrokerEvent::Fetched(other_id)));
    assert_eq!(h.broker.pending_count(), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_concurrency_never_exceeds_slot_count() {
    for concurrency in [1, 2, 3, 6] {
        let h = Harness::new();
        let (registry, peak) = sleeper_registry(Duration::from_millis(100), 0);
        for _ in 0..12 {
            h.publish("sleep");
        }

        let handle = h.start(Harness::config(concurrency, Duration::from_secs(5)), registry);
        let backend = h.backend.clone();
        assert!(eventually(Duration::from_secs(30), || backend.len() == 12).await);
        h.stop(handle).await;

        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= concurrency, "concurrency {concurrency}, peak {peak}");
        assert_eq!(peak, concurrency);
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_retry_backoff_then_permanent_failure() {
    let h = Harness::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);

    let mut registry = TaskRegistry::new();
    registry
        .register(
            "always_fails",
            TaskPolicy::default().with_retry(
                RetryPolicy::exponential()
                    .with_max_retries(2)
                    .with_initial_interval(Duration::from_secs(1))
                    .with_backoff_coefficient(2.0),
            ),
            move |_ctx, _args| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<Value, _>(TaskError::retryable("upstream unavailable")) }
            },
        )
        .unwrap();

    let id = h.publish("always_fails");
    let handle = h.start(Harness::config(4, Duration::from_secs(5)), registry);

    let backend = h.backend.clone();
    assert!(eventually(Duration::from_secs(30), || backend.len() == 1).await);
    h.stop(handle).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(
        h.broker.requeues(id),
        vec![(Duration::from_secs(1), 1), (Duration::from_secs(2), 2)]
    );
    assert_eq!(h.broker.ack_count(id), 1);
    h.assert_answered(id);

    let result = h.backend.get_result(id).await.unwrap().unwrap();
    assert_eq!(result.state, TaskState::Failure);
    assert_eq!(result.retries, 2);
    assert_eq!(result.error.unwrap().message, "upstream unavailable");
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_shutdown_drains_in_flight_tasks() {
    let h = Harness::new();
    let (registry, _) = sleeper_registry(Duration::from_secs(2), 0);
    let ids = [h.publish("sleep"), h.publish("sleep")];

    let handle = h.start(Harness::config(4, Duration::from_secs(5)), registry);
    let shutdown = h.shutdown.clone();
    assert!(eventually(Duration::from_secs(1), || shutdown.active_executions() == 2).await);

    let signaled_at = Instant::now();
    let report = h.stop(handle).await;

    assert_eq!(report, DrainReport::Completed);
    assert!(signaled_at.elapsed() < Duration::from_secs(5));
    assert_eq!(h.shutdown.state(), DispatcherState::Stopped);
    assert_eq!(h.shutdown.active_executions(), 0);
    for id in ids {
        assert_eq!(h.broker.ack_count(id), 1);
        assert!(h.backend.get_result(id).await.unwrap().is_some());
    }
    assert_eq!(h.broker.in_flight_count(), 0);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_drain_timeout_abandons_long_task() {
    let h = Harness::new();
    let (registry, _) = sleeper_registry(Duration::from_secs(10), 0);
    let id = h.publish("sleep");

    let handle = h.start(Harness::config(4, Duration::from_secs(5)), registry);
    let shutdown = h.shutdown.clone();
    assert!(eventually(Duration::from_secs(1), || shutdown.active_executions() == 1).await);

    let signaled_at = Instant::now();
    let report = h.stop(handle).await;
    let stopped_after = signaled_at.elapsed();

    assert_eq!(report, DrainReport::TimedOut { abandoned: 1 });
    assert!(stopped_after >= Duration::from_secs(5));
    assert!(stopped_after < Duration::from_secs(6));

    // Let the abandoned handler finish: it must not ack or record anything
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.broker.ack_count(id), 0);
    assert_eq!(h.broker.reject_count(id), 0);
    assert_eq!(h.broker.in_flight_count(), 1);
    assert!(h.backend.is_empty());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_forced_shutdown_skips_drain() {
    let h = Harness::new();
    let (registry, _) = sleeper_registry(Duration::from_secs(60), 0);
    h.publish("sleep");
    h.publish("sleep");

    let handle = h.start(Harness::config(4, Duration::from_secs(30)), registry);
    let shutdown = h.shutdown.clone();
    assert!(eventually(Duration::from_secs(1), || shutdown.active_executions() == 2).await);

    let signaled_at = Instant::now();
    h.shutdown.signal();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.shutdown.state(), DispatcherState::Draining);
    h.shutdown.force();

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report, DrainReport::Forced { abandoned: 2 });
    assert!(signaled_at.elapsed() < Duration::from_secs(2));
    assert!(h.backend.is_empty());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_wait_reports_stop() {
    let h = Harness::new();
    let (registry, _) = sleeper_registry(Duration::from_secs(1), 0);
    let handle = h.start(Harness::config(1, Duration::from_secs(5)), registry);

    assert!(!h.shutdown.wait(Duration::from_millis(100)).await);
    h.shutdown.signal();
    assert!(h.shutdown.wait(Duration::from_secs(5)).await);
    assert!(handle.await.unwrap().is_ok());
}

// ============================================
// Error handling
// ============================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_unknown_task_is_rejected_once() {
    let h = Harness::new();
    let (registry, _) = sleeper_registry(Duration::ZERO, 0);
    let id = h.publish("not_registered");

    let handle = h.start(Harness::config(4, Duration::from_secs(5)), registry);
    let backend = h.backend.clone();
    assert!(eventually(Duration::from_secs(5), || backend.len() == 1).await);
    h.stop(handle).await;

    assert_eq!(h.broker.reject_count(id), 1);
    assert!(h.broker.requeues(id).is_empty());
    assert_eq!(h.broker.ack_count(id), 0);
    assert_eq!(h.broker.pending_count(), 0);

    let result = h.backend.get_result(id).await.unwrap().unwrap();
    assert_eq!(result.state, TaskState::Failure);
    assert_eq!(
        result.error.unwrap().error_type.as_deref(),
        Some("NotRegistered")
    );
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_expired_message_is_not_executed() {
    let h = Harness::new();
    let (registry, peak) = sleeper_registry(Duration::ZERO, 0);
    let message = TaskMessage::new("sleep", TaskArgs::new())
        .with_expires(Utc::now() - chrono::Duration::minutes(1));
    let id = message.id;
    h.broker.publish(message);

    let handle = h.start(Harness::config(4, Duration::from_secs(5)), registry);
    let backend = h.backend.clone();
    assert!(eventually(Duration::from_secs(5), || backend.len() == 1).await);
    h.stop(handle).await;

    assert_eq!(peak.load(Ordering::SeqCst), 0);
    assert_eq!(h.broker.ack_count(id), 1);
    let result = h.backend.get_result(id).await.unwrap().unwrap();
    assert_eq!(result.error.unwrap().error_type.as_deref(), Some("Expired"));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_execution_timeout_is_retryable() {
    let h = Harness::new();
    let mut registry = TaskRegistry::new();
    registry
        .register(
            "slow",
            TaskPolicy::default()
                .with_timeout(Duration::from_secs(1))
                .with_retry(RetryPolicy::fixed(Duration::from_secs(1), 1)),
            |_ctx, _args| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            },
        )
        .unwrap();
    let id = h.publish("slow");

    let handle = h.start(Harness::config(2, Duration::from_secs(5)), registry);
    let backend = h.backend.clone();
    assert!(eventually(Duration::from_secs(30), || backend.len() == 1).await);
    h.stop(handle).await;

    assert_eq!(h.broker.requeues(id), vec![(Duration::from_secs(1), 1)]);
    let result = h.backend.get_result(id).await.unwrap().unwrap();
    assert_eq!(result.state, TaskState::Failure);
    assert_eq!(result.error.unwrap().error_type.as_deref(), Some("Timeout"));
    h.assert_answered(id);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_panicking_handler_releases_slot_and_retries() {
    let h = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let mut registry = TaskRegistry::new();
    registry
        .register(
            "panics_once",
            TaskPolicy::default().with_retry(RetryPolicy::fixed(Duration::from_secs(1), 3)),
            move |_ctx, _args| {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        panic!("handler bug");
                    }
                    Ok(json!("recovered"))
                }
            },
        )
        .unwrap();
    let id = h.publish("panics_once");

    let handle = h.start(Harness::config(1, Duration::from_secs(5)), registry);
    let backend = h.backend.clone();
    assert!(eventually(Duration::from_secs(30), || backend.len() == 1).await);
    h.stop(handle).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.broker.requeues(id), vec![(Duration::from_secs(1), 1)]);
    assert_eq!(h.shutdown.active_executions(), 0);

    let result = h.backend.get_result(id).await.unwrap().unwrap();
    assert_eq!(result.state, TaskState::Success);
    assert_eq!(result.retries, 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_invalid_payload_is_permanent() {
    let h = Harness::new();
    let (registry, peak) = sleeper_registry(Duration::ZERO, 3);
    let message = TaskMessage::new("sleep", TaskArgs::new())
        .with_payload(TaskPayload::new("application/x-python-pickle", vec![0x80, 0x04]));
    let id = message.id;
    h.broker.publish(message);

    let handle = h.start(Harness::config(1, Duration::from_secs(5)), registry);
    let backend = h.backend.clone();
    assert!(eventually(Duration::from_secs(5), || backend.len() == 1).await);
    h.stop(handle).await;

    assert_eq!(peak.load(Ordering::SeqCst), 0);
    assert!(h.broker.requeues(id).is_empty());
    assert_eq!(h.broker.ack_count(id), 1);
    let result = h.backend.get_result(id).await.unwrap().unwrap();
    assert_eq!(
        result.error.unwrap().error_type.as_deref(),
        Some("InvalidPayload")
    );
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_every_fetch_is_answered_exactly_once() {
    let h = Harness::new();
    let mut registry = TaskRegistry::new();
    registry
        .register(
            "ok",
            TaskPolicy::default(),
            |_ctx, _args| async { Ok(json!(1)) },
        )
        .unwrap();
    registry
        .register(
            "bad",
            TaskPolicy::default(),
            |_ctx, _args| async { Err::<Value, _>(TaskError::permanent("invalid")) },
        )
        .unwrap();
    registry
        .register(
            "flaky",
            TaskPolicy::default().with_retry(RetryPolicy::fixed(Duration::from_millis(200), 2)),
            |ctx, _args| async move {
                if ctx.retries < 2 {
                    Err(TaskError::retryable("not yet"))
                } else {
                    Ok(json!("done"))
                }
            },
        )
        .unwrap();

    let mut ids = Vec::new();
    for task in ["ok", "bad", "flaky", "missing"].iter().cycle().take(20) {
        ids.push(h.publish(task));
    }

    let handle = h.start(Harness::config(3, Duration::from_secs(5)), registry);
    let backend = h.backend.clone();
    assert!(eventually(Duration::from_secs(60), || backend.len() == 20).await);
    assert_eq!(h.stop(handle).await, DrainReport::Completed);

    for id in ids {
        h.assert_answered(id);
    }
    assert_eq!(h.broker.in_flight_count(), 0);
    assert_eq!(h.broker.pending_count(), 0);
    assert_eq!(h.backend.count(TaskState::Success), 10);
    assert_eq!(h.backend.count(TaskState::Failure), 10);
}

// ============================================
// Broker connectivity
// ============================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_unreachable_broker_at_startup() {
    let h = Harness::new();
    h.broker.set_connected(false);
    let (registry, _) = sleeper_registry(Duration::ZERO, 0);

    let result = h
        .start(Harness::config(4, Duration::from_secs(5)), registry)
        .await
        .unwrap();

    assert!(matches!(result, Err(WorkerError::Connect(_))));
    assert_eq!(h.shutdown.state(), DispatcherState::Stopped);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_dispatcher_survives_broker_outage() {
    let h = Harness::new();
    let (registry, _) = sleeper_registry(Duration::ZERO, 0);
    let handle = h.start(Harness::config(4, Duration::from_secs(5)), registry);

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.broker.set_connected(false);
    let id = h.publish("sleep");

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!handle.is_finished());
    assert!(h.backend.is_empty());

    h.broker.set_connected(true);
    let backend = h.backend.clone();
    assert!(eventually(Duration::from_secs(10), || backend.len() == 1).await);
    h.stop(handle).await;

    assert_eq!(h.broker.ack_count(id), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_signal_while_waiting_for_slot_returns_message() {
    let h = Harness::new();
    let (registry, _) = sleeper_registry(Duration::from_secs(2), 0);
    let first = h.publish("sleep");
    let second = h.publish("sleep");

    let handle = h.start(Harness::config(1, Duration::from_secs(5)), registry);
    let shutdown = h.shutdown.clone();
    assert!(eventually(Duration::from_secs(1), || {
        shutdown.state() == DispatcherState::Dispatching && shutdown.active_executions() == 1
    })
    .await);

    assert_eq!(h.stop(handle).await, DrainReport::Completed);

    assert_eq!(h.broker.ack_count(first), 1);
    assert_eq!(h.broker.requeues(second), vec![(Duration::ZERO, 0)]);
    assert_eq!(h.broker.pending_count(), 1);
    assert!(h.backend.get_result(second).await.unwrap().is_none());
}

// ============================================
// Redelivery
// ============================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_redelivery_keeps_first_result() {
    let h = Harness::new();
    let mut registry = TaskRegistry::new();
    registry
        .register("echo", TaskPolicy::default(), |_ctx, _args| async {
            Ok(json!("second"))
        })
        .unwrap();

    let id = h.publish("echo");
    h.backend
        .store_result(TaskResult::success(id, "echo", 0, json!("first")))
        .await
        .unwrap();

    let handle = h.start(Harness::config(1, Duration::from_secs(5)), registry);
    let broker = h.broker.clone();
    assert!(eventually(Duration::from_secs(5), || broker.ack_count(id) == 1).await);
    h.stop(handle).await;

    let result = h.backend.get_result(id).await.unwrap().unwrap();
    assert_eq!(result.result, Some(json!("first")));
}

/// Result backend whose first `failures` writes are refused
struct FlakyBackend {
    failures: AtomicUsize,
    inner: InMemoryResultBackend,
}

#[async_trait::async_trait]
impl ResultBackend for FlakyBackend {
    async fn store_result(&self, result: TaskResult) -> Result<(), BackendError> {
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BackendError::Database("connection refused".into()));
        }
        self.inner.store_result(result).await
    }

    async fn get_result(&self, task_id: Uuid) -> Result<Option<TaskResult>, BackendError> {
        self.inner.get_result(task_id).await
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_unrecorded_result_is_not_acked() {
    let h = Harness::new();
    let backend = Arc::new(FlakyBackend {
        failures: AtomicUsize::new(1),
        inner: InMemoryResultBackend::new(),
    });
    let runs = Arc::new(AtomicUsize::new(0));
    let runs_in = Arc::clone(&runs);
    let mut registry = TaskRegistry::new();
    registry
        .register("ok", TaskPolicy::default(), move |_ctx, _args| {
            let runs = Arc::clone(&runs_in);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(json!("done"))
            }
        })
        .unwrap();

    let id = h.publish("ok");
    let worker = Worker::new(
        Harness::config(1, Duration::from_secs(5)),
        h.broker.clone(),
        backend.clone(),
        registry,
        h.shutdown.clone(),
    );
    let handle = tokio::spawn(worker.run());

    let broker = h.broker.clone();
    assert!(eventually(Duration::from_secs(30), || broker.ack_count(id) == 1).await);
    h.stop(handle).await;

    assert_eq!(h.broker.requeues(id), vec![(RESULT_STORE_RETRY_DELAY, 0)]);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    h.assert_answered(id);
    let result = backend.get_result(id).await.unwrap().unwrap();
    assert_eq!(result.state, TaskState::Success);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_abandoned_message_completes_on_next_worker() {
    let broker = InMemoryBroker::new().with_visibility_timeout(Duration::from_secs(30));
    let first = Harness::with_broker(broker);
    let (registry, _) = sleeper_registry(Duration::from_secs(10), 0);
    let id = first.publish("sleep");

    let handle = first.start(Harness::config(1, Duration::from_secs(1)), registry);
    let shutdown = first.shutdown.clone();
    assert!(eventually(Duration::from_secs(1), || shutdown.active_executions() == 1).await);
    assert_eq!(first.stop(handle).await, DrainReport::TimedOut { abandoned: 1 });

    // A fresh worker on the same broker picks the message up once its visibility lapses
    let second = Harness {
        broker: first.broker.clone(),
        backend: first.backend.clone(),
        shutdown: ShutdownCoordinator::new(),
    };
    let (registry, _) = sleeper_registry(Duration::from_secs(10), 0);
    let handle = second.start(Harness::config(1, Duration::from_secs(30)), registry);

    let backend = second.backend.clone();
    assert!(eventually(Duration::from_secs(120), || backend.len() == 1).await);
    second.stop(handle).await;

    assert!(second
        .broker
        .events()
        .contains(&BrokerEvent::Redelivered(id)));
    assert_eq!(second.broker.ack_count(id), 1);
    let result = second.backend.get_result(id).await.unwrap().unwrap();
    assert_eq!(result.state, TaskState::Success);
}
