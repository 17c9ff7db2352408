//! Integration tests for the queue manager running against real stores.
//!
//! Tests: producer → QueueManager → QueueStore → background cycles → consumer
//!
//! Verifies:
//! - Tier precedence through the manager's pass-through operations
//! - Stale reclamation and retry promotion, on demand and on the timers
//! - Lifecycle edges: failed start, idempotent stop, bounded shutdown
//! - Fault isolation: failing or panicking cycles never stop the manager

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use tokio::sync::broadcast;

    use dispatchq_core::{EntryId, Priority, QueueEntry, QueueMetrics};

    use crate::manager::{
        FailureReason, ManagerError, ManagerState, QueueEvent, QueueManager, QueueManagerConfig,
    };
    use crate::queue_store::{InMemoryQueueStore, QueueStore, RetryEntry, StoreError, StoreEvent};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn entry(id: &str, priority: Priority) -> QueueEntry {
        QueueEntry::from_parts(id, priority, json!({ "prompt": format!("request {id}") })).unwrap()
    }

    /// Timers far enough out that only on-demand cycles run during a test.
    fn quiet_config() -> QueueManagerConfig {
        QueueManagerConfig::default()
    }

    fn fast_config() -> QueueManagerConfig {
        QueueManagerConfig::default()
            .with_cleanup_interval(ms(10))
            .with_retry_interval(ms(10))
            .with_retry_delay(ms(10))
            .with_graceful_shutdown_timeout(ms(500))
    }

    async fn running(
        config: QueueManagerConfig,
    ) -> (Arc<InMemoryQueueStore>, QueueManager<Arc<InMemoryQueueStore>>) {
        let store = Arc::new(InMemoryQueueStore::new());
        let manager = QueueManager::new(Arc::clone(&store), config).unwrap();
        manager.start().await.unwrap();
        (store, manager)
    }

    fn drain_events(rx: &mut broadcast::Receiver<QueueEvent>) -> Vec<QueueEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Fault applied to the scan operations the background cycles use.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Fault {
        None,
        Fail,
        Panic,
        Slow(Duration),
    }

    /// Consumer call replayed right after an in-flight snapshot is taken.
    #[derive(Debug, Clone)]
    enum ConsumerCall {
        Acknowledge(EntryId),
        Release(EntryId),
    }

    /// In-memory store whose scan operations can be made to fail, panic or stall,
    /// and which can run consumer calls while a cleanup scan is in progress.
    struct FlakyStore {
        inner: InMemoryQueueStore,
        fault: Mutex<Fault>,
        during_scan: Mutex<Vec<ConsumerCall>>,
        consumer_results: Mutex<Vec<bool>>,
    }

    impl FlakyStore {
        fn new(fault: Fault) -> Self {
            Self {
                inner: InMemoryQueueStore::new(),
                fault: Mutex::new(fault),
                during_scan: Mutex::new(Vec::new()),
                consumer_results: Mutex::new(Vec::new()),
            }
        }

        fn during_next_scan(&self, calls: Vec<ConsumerCall>) {
            *self.during_scan.lock().unwrap() = calls;
        }

        fn consumer_results(&self) -> Vec<bool> {
            self.consumer_results.lock().unwrap().clone()
        }

        fn set_fault(&self, fault: Fault) {
            *self.fault.lock().unwrap() = fault;
        }

        async fn inject(&self, op: &str) -> Result<(), StoreError> {
            let fault = *self.fault.lock().unwrap();
            match fault {
                Fault::None => Ok(()),
                Fault::Fail => Err(StoreError::backend(format!("injected {op} failure"))),
                Fault::Panic => panic!("injected {op} panic"),
                Fault::Slow(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(())
                }
            }
        }
    }

    #[async_trait]
    impl QueueStore for FlakyStore {
        async fn connect(&self) -> Result<(), StoreError> {
            self.inner.connect().await
        }

        async fn disconnect(&self) -> Result<(), StoreError> {
            self.inner.disconnect().await
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
            self.inner.subscribe()
        }

        async fn enqueue(&self, entry: QueueEntry) -> Result<(), StoreError> {
            self.inner.enqueue(entry).await
        }

        async fn dequeue(&self, priority: Option<Priority>) -> Result<Option<QueueEntry>, StoreError> {
            self.inner.dequeue(priority).await
        }

        async fn peek(&self, priority: Option<Priority>) -> Result<Option<QueueEntry>, StoreError> {
            self.inner.peek(priority).await
        }

        async fn claim(
            &self,
            priority: Option<Priority>,
            now: DateTime<Utc>,
        ) -> Result<Option<QueueEntry>, StoreError> {
            self.inner.claim(priority, now).await
        }

        async fn acknowledge(&self, id: &EntryId) -> Result<bool, StoreError> {
            self.inner.acknowledge(id).await
        }

        async fn release(&self, id: &EntryId) -> Result<bool, StoreError> {
            self.inner.release(id).await
        }

        async fn in_flight_snapshot(&self) -> Result<Vec<QueueEntry>, StoreError> {
            self.inject("in_flight_snapshot").await?;
            let snapshot = self.inner.in_flight_snapshot().await?;

            let calls = std::mem::take(&mut *self.during_scan.lock().unwrap());
            for call in calls {
                let done = match call {
                    ConsumerCall::Acknowledge(id) => self.inner.acknowledge(&id).await?,
                    ConsumerCall::Release(id) => self.inner.release(&id).await?,
                };
                self.consumer_results.lock().unwrap().push(done);
            }
            Ok(snapshot)
        }

        async fn reclaim_in_flight(
            &self,
            id: &EntryId,
            observed_timestamp: i64,
        ) -> Result<Option<QueueEntry>, StoreError> {
            self.inner.reclaim_in_flight(id, observed_timestamp).await
        }

        async fn restore_in_flight(&self, entry: QueueEntry) -> Result<(), StoreError> {
            self.inner.restore_in_flight(entry).await
        }

        async fn in_flight_count(&self) -> Result<usize, StoreError> {
            self.inner.in_flight_count().await
        }

        async fn schedule_retry(
            &self,
            entry: QueueEntry,
            eligible_at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.inner.schedule_retry(entry, eligible_at).await
        }

        async fn take_due_retries(&self, now: DateTime<Utc>) -> Result<Vec<RetryEntry>, StoreError> {
            self.inject("take_due_retries").await?;
            self.inner.take_due_retries(now).await
        }

        async fn retry_depth(&self) -> Result<usize, StoreError> {
            self.inner.retry_depth().await
        }

        async fn queue_depth(&self, priority: Priority) -> Result<usize, StoreError> {
            self.inner.queue_depth(priority).await
        }

        async fn queue_metrics(&self) -> Result<QueueMetrics, StoreError> {
            self.inner.queue_metrics().await
        }
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn start_fails_and_stays_stopped_when_connect_is_rejected() {
        let store = Arc::new(InMemoryQueueStore::new());
        store.set_unreachable(true);
        let manager = QueueManager::new(Arc::clone(&store), quiet_config()).unwrap();

        let err = manager.start().await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::ConnectionFailure(StoreError::Connection(_))
        ));
        assert!(!manager.is_running());
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert!(!manager.health_status().await.background_tasks_active);

        // No partial state: a later start succeeds once the store is back.
        store.set_unreachable(false);
        manager.start().await.unwrap();
        assert!(manager.is_running());
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_is_only_valid_from_stopped() {
        let (_store, manager) = running(quiet_config()).await;

        let err = manager.start().await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::InvalidState {
                actual: ManagerState::Running
            }
        ));
        assert!(manager.is_running());
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_a_noop_when_stopped_and_disconnects_when_running() {
        let store = Arc::new(InMemoryQueueStore::new());
        let manager = QueueManager::new(Arc::clone(&store), quiet_config()).unwrap();
        manager.stop().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Stopped);

        manager.start().await.unwrap();
        assert!(store.is_connected());
        manager.stop().await.unwrap();
        manager.stop().await.unwrap();

        assert!(!manager.is_running());
        assert!(!store.is_connected());
        assert_eq!(
            manager.enqueue(entry("late", Priority::High)).await,
            Err(StoreError::Unavailable)
        );
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let config = quiet_config().with_cleanup_interval(Duration::ZERO);
        let result = QueueManager::new(InMemoryQueueStore::new(), config);
        assert!(matches!(result, Err(ManagerError::Config(_))));
    }

    #[tokio::test]
    async fn stop_finishes_within_the_shutdown_bound_even_if_a_cycle_hangs() {
        let store = Arc::new(FlakyStore::new(Fault::Slow(ms(2_000))));
        let config = fast_config().with_graceful_shutdown_timeout(ms(50));
        let manager = QueueManager::new(Arc::clone(&store), config).unwrap();
        manager.start().await.unwrap();

        // Let a cleanup cycle begin and block inside the store.
        tokio::time::sleep(ms(40)).await;

        let started = Instant::now();
        manager.stop().await.unwrap();
        assert!(started.elapsed() < ms(1_000));
        assert!(!manager.is_running());
        assert!(!store.is_connected());
    }

    // ---------------------------------------------------------------------
    // Pass-through operations
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn dequeue_through_manager_respects_tier_precedence() {
        let (_store, manager) = running(quiet_config()).await;
        manager.enqueue(entry("a", Priority::High)).await.unwrap();
        manager.enqueue(entry("b", Priority::Low)).await.unwrap();
        manager.enqueue(entry("c", Priority::High)).await.unwrap();

        let metrics = manager.queue_metrics().await.unwrap();
        assert_eq!(metrics.depth(Priority::High), 2);
        assert_eq!(metrics.depth(Priority::Low), 1);
        assert_eq!(metrics.total_depth, 3);

        assert_eq!(manager.peek(None).await.unwrap().unwrap().id.as_str(), "a");

        let mut order = Vec::new();
        while let Some(e) = manager.dequeue(None).await.unwrap() {
            order.push(e.id.into_inner());
        }
        assert_eq!(order, vec!["a", "c", "b"]);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn queue_metrics_errors_surface_unchanged() {
        let store = Arc::new(InMemoryQueueStore::new());
        let manager = QueueManager::new(Arc::clone(&store), quiet_config()).unwrap();
        assert_eq!(manager.queue_metrics().await, Err(StoreError::Unavailable));
    }

    #[tokio::test]
    async fn acknowledged_claims_are_not_reclaimed() {
        let (store, manager) = running(quiet_config()).await;
        manager.enqueue(entry("done", Priority::Normal)).await.unwrap();

        let claimed = manager.claim(None).await.unwrap().unwrap();
        assert_eq!(store.in_flight_count().await.unwrap(), 1);
        assert!(manager.acknowledge(&claimed.id).await.unwrap());
        assert!(!manager.acknowledge(&claimed.id).await.unwrap());

        let report = manager.run_cleanup_cycle().await.unwrap();
        assert_eq!(report.scanned, 0);
        assert_eq!(store.retry_depth().await.unwrap(), 0);
        manager.stop().await.unwrap();
    }

    // ---------------------------------------------------------------------
    // Stale reclamation
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn in_flight_entry_past_the_timeout_is_handed_to_retry() {
        let config = quiet_config().with_stale_request_timeout(ms(300_000));
        let (store, manager) = running(config).await;
        let mut events = manager.subscribe();
        let now = Utc::now().timestamp_millis();

        let mut stale = entry("stale", Priority::High);
        stale.payload.timestamp = now - 400_000;
        let mut fresh = entry("fresh", Priority::High);
        fresh.payload.timestamp = now - 1_000;
        store.restore_in_flight(stale).await.unwrap();
        store.restore_in_flight(fresh.clone()).await.unwrap();

        let report = manager.run_cleanup_cycle().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.still_in_flight, 1);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.scheduled_for_retry, 1);
        assert_eq!(report.permanently_failed, 0);

        // The fresh entry never left the in-flight set.
        let still_in_flight = store.in_flight_snapshot().await.unwrap();
        assert_eq!(still_in_flight, vec![fresh]);
        assert_eq!(store.retry_depth().await.unwrap(), 1);
        // Not visible to consumers while waiting for retry.
        assert!(manager.peek(None).await.unwrap().is_none());

        let events = drain_events(&mut events);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            QueueEvent::ScheduledForRetry { entry_id, priority: Priority::High, retry_count: 0, .. }
                if entry_id.as_str() == "stale"
        ));
        assert_eq!(manager.counters().await.reclaimed, 1);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stale_entry_with_no_retries_left_is_permanently_failed() {
        let config = quiet_config().with_max_retries(3);
        let (store, manager) = running(config).await;
        let mut events = manager.subscribe();

        let mut exhausted = entry("worn-out", Priority::Normal);
        exhausted.payload.retry_count = 3;
        exhausted.payload.timestamp = 0;
        store.restore_in_flight(exhausted).await.unwrap();

        let report = manager.run_cleanup_cycle().await.unwrap();
        assert_eq!(report.permanently_failed, 1);
        assert_eq!(store.in_flight_count().await.unwrap(), 0);
        assert_eq!(store.retry_depth().await.unwrap(), 0);
        assert!(manager.dequeue(None).await.unwrap().is_none());

        let events = drain_events(&mut events);
        assert!(matches!(
            events.as_slice(),
            [QueueEvent::PermanentFailure { reason: FailureReason::StaleExhausted, retry_count: 3, .. }]
        ));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn released_claim_is_reclaimed_on_the_next_cycle() {
        let (store, manager) = running(quiet_config()).await;
        manager.enqueue(entry("flaky", Priority::Low)).await.unwrap();

        let claimed = manager.claim(Some(Priority::Low)).await.unwrap().unwrap();
        assert!(manager.release(&claimed.id).await.unwrap());

        let report = manager.run_cleanup_cycle().await.unwrap();
        assert_eq!(report.scheduled_for_retry, 1);
        assert_eq!(store.retry_depth().await.unwrap(), 1);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn consumer_calls_during_the_scan_are_not_undone() {
        let store = Arc::new(FlakyStore::new(Fault::None));
        let manager = QueueManager::new(Arc::clone(&store), quiet_config()).unwrap();
        manager.start().await.unwrap();
        let mut events = manager.subscribe();

        // Both claims are long past the stale timeout when the scan starts.
        let mut done = entry("done", Priority::High);
        done.payload.timestamp = 1;
        let mut bounced = entry("bounced", Priority::Normal);
        bounced.payload.timestamp = 1;
        store.restore_in_flight(done.clone()).await.unwrap();
        store.restore_in_flight(bounced.clone()).await.unwrap();

        store.during_next_scan(vec![
            ConsumerCall::Acknowledge(done.id.clone()),
            ConsumerCall::Release(bounced.id.clone()),
        ]);
        let report = manager.run_cleanup_cycle().await.unwrap();
        assert_eq!(store.consumer_results(), vec![true, true]);
        assert_eq!(report.scanned, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.scheduled_for_retry, 0);
        assert_eq!(report.permanently_failed, 0);

        // The acknowledged entry stays gone; the released one is still tracked.
        let in_flight = store.in_flight_snapshot().await.unwrap();
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].id, bounced.id);
        assert_eq!(in_flight[0].payload.timestamp, 0);
        assert!(!store.acknowledge(&done.id).await.unwrap());
        assert_eq!(store.retry_depth().await.unwrap(), 0);
        assert!(drain_events(&mut events).is_empty());

        // The release is honoured by the following cycle.
        let report = manager.run_cleanup_cycle().await.unwrap();
        assert_eq!(report.scheduled_for_retry, 1);
        assert_eq!(store.in_flight_count().await.unwrap(), 0);
        assert_eq!(store.retry_depth().await.unwrap(), 1);
        manager.stop().await.unwrap();
    }

    // ---------------------------------------------------------------------
    // Retry promotion
    // ---------------------------------------------------------------------

    #[test]
    fn should_retry_request_is_false_at_max_retries() {
        let store = InMemoryQueueStore::new();
        let manager = QueueManager::new(store, quiet_config().with_max_retries(3)).unwrap();

        let mut e = entry("r", Priority::High);
        e.payload.retry_count = 2;
        assert!(manager.should_retry_request(&e));
        e.payload.retry_count = 3;
        assert!(!manager.should_retry_request(&e));
    }

    #[tokio::test]
    async fn due_retry_is_requeued_at_its_original_priority() {
        let (store, manager) = running(quiet_config()).await;
        let mut events = manager.subscribe();

        let mut retry = entry("again", Priority::Low);
        retry.payload.retry_count = 1;
        retry.payload.timestamp = 0;
        store
            .schedule_retry(retry, Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        // Not yet eligible; stays put.
        store
            .schedule_retry(entry("later", Priority::High), Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();

        let report = manager.run_retry_cycle().await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.requeued, 1);
        assert_eq!(store.retry_depth().await.unwrap(), 1);

        assert!(manager.dequeue(Some(Priority::High)).await.unwrap().is_none());
        let promoted = manager.dequeue(Some(Priority::Low)).await.unwrap().unwrap();
        assert_eq!(promoted.id.as_str(), "again");
        assert_eq!(promoted.retry_count(), 2);
        assert!(promoted.payload.timestamp > 0);
        assert_eq!(promoted.payload.data["prompt"], "request again");

        let events = drain_events(&mut events);
        assert!(matches!(
            events.as_slice(),
            [QueueEvent::Retried { retry_count: 2, priority: Priority::Low, .. }]
        ));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn retry_entry_at_max_retries_is_discarded_and_never_seen_again() {
        let (store, manager) = running(quiet_config().with_max_retries(3)).await;
        let mut events = manager.subscribe();

        let mut exhausted = entry("gone", Priority::High);
        exhausted.payload.retry_count = 3;
        store
            .schedule_retry(exhausted, Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();

        let report = manager.run_retry_cycle().await.unwrap();
        assert_eq!(report.permanently_failed, 1);
        assert_eq!(report.requeued, 0);

        assert!(manager.peek(None).await.unwrap().is_none());
        assert!(manager.dequeue(None).await.unwrap().is_none());
        assert_eq!(store.retry_depth().await.unwrap(), 0);
        assert_eq!(manager.counters().await.permanently_failed, 1);

        let events = drain_events(&mut events);
        assert!(matches!(
            events.as_slice(),
            [QueueEvent::PermanentFailure { reason: FailureReason::RetriesExhausted, .. }]
        ));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn timers_reclaim_and_promote_an_abandoned_claim() {
        let config = fast_config().with_stale_request_timeout(ms(50));
        let (_store, manager) = running(config).await;
        let mut events = manager.subscribe();

        manager.enqueue(entry("abandoned", Priority::Normal)).await.unwrap();
        let claimed = manager.claim(None).await.unwrap().unwrap();
        assert_eq!(claimed.retry_count(), 0);

        // Stale after 50ms, eligible 10ms later, promoted on a 10ms tick.
        tokio::time::sleep(ms(400)).await;

        let back = manager.dequeue(None).await.unwrap().unwrap();
        assert_eq!(back.id.as_str(), "abandoned");
        assert_eq!(back.retry_count(), 1);

        let events = drain_events(&mut events);
        assert!(matches!(events.first(), Some(QueueEvent::ScheduledForRetry { .. })));
        assert!(events.iter().any(|e| matches!(e, QueueEvent::Retried { retry_count: 1, .. })));

        let health = manager.health_status().await;
        assert!(health.last_cleanup_run.is_some());
        assert!(health.last_retry_process_run.is_some());
        assert_eq!(health.counters.reclaimed, 1);
        assert_eq!(health.counters.retried, 1);
        manager.stop().await.unwrap();
    }

    // ---------------------------------------------------------------------
    // Fault isolation
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn failing_cycles_never_stop_the_manager() {
        let store = Arc::new(FlakyStore::new(Fault::Fail));
        let manager = QueueManager::new(Arc::clone(&store), fast_config()).unwrap();
        manager.start().await.unwrap();

        tokio::time::sleep(ms(100)).await;
        assert!(manager.is_running());
        let failures = manager.counters().await.cycle_failures;
        assert!(failures > 0);

        // Recovers once the fault clears.
        store.set_fault(Fault::None);
        manager.enqueue(entry("ok", Priority::High)).await.unwrap();
        assert!(manager.run_cleanup_cycle().await.is_ok());
        assert!(manager.health_status().await.is_healthy);

        manager.stop().await.unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn panicking_cycles_are_contained() {
        let store = Arc::new(FlakyStore::new(Fault::Panic));
        let manager = QueueManager::new(Arc::clone(&store), fast_config()).unwrap();
        manager.start().await.unwrap();

        tokio::time::sleep(ms(100)).await;
        assert!(manager.is_running());
        assert!(manager.counters().await.cycle_failures > 0);
        assert!(manager.health_status().await.background_tasks_active);

        store.set_fault(Fault::None);
        manager.stop().await.unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn on_demand_cycle_errors_are_returned_to_the_caller() {
        let store = Arc::new(FlakyStore::new(Fault::None));
        let manager = QueueManager::new(Arc::clone(&store), quiet_config()).unwrap();
        manager.start().await.unwrap();

        store.set_fault(Fault::Fail);
        let err = manager.run_retry_cycle().await.unwrap_err();
        assert!(matches!(err, ManagerError::Store(StoreError::Backend(_))));
        assert!(manager.is_running());

        store.set_fault(Fault::None);
        manager.stop().await.unwrap();
    }

    // ---------------------------------------------------------------------
    // Health
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn health_reflects_store_outage_while_running() {
        let (store, manager) = running(quiet_config()).await;
        manager.enqueue(entry("h", Priority::High)).await.unwrap();

        let healthy = manager.health_status().await;
        assert!(healthy.is_running);
        assert!(healthy.is_healthy);
        assert!(healthy.store_connected);
        assert!(healthy.background_tasks_active);
        assert_eq!(healthy.queue_metrics.unwrap().total_depth, 1);
        assert_eq!(healthy.in_flight, Some(0));
        assert_eq!(healthy.retry_depth, Some(0));

        store.set_unreachable(true);
        let degraded = manager.health_status().await;
        assert!(degraded.is_running);
        assert!(!degraded.is_healthy);
        assert!(!degraded.store_connected);
        assert!(degraded.queue_metrics.is_none());
        assert!(degraded.in_flight.is_none());

        store.set_unreachable(false);
        assert!(manager.health_status().await.is_healthy);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn health_of_a_stopped_manager() {
        let manager = QueueManager::new(InMemoryQueueStore::new(), quiet_config()).unwrap();
        let health = manager.health_status().await;
        assert!(!health.is_running);
        assert!(!health.is_healthy);
        assert!(!health.store_connected);
        assert!(!health.background_tasks_active);
        assert!(health.last_cleanup_run.is_none());

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["isRunning"], false);
        assert!(json["queueMetrics"].is_null());
    }
}
