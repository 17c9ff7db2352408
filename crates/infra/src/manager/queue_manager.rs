//! Queue manager: store lifecycle plus the two background maintenance tasks.
//!
//! ## Background tasks
//!
//! - **Stale reclamation** (every `cleanup_interval`): scans a snapshot of the
//!   in-flight set and moves entries older than `stale_request_timeout` out one
//!   id at a time, only if the store still holds the timestamp that was seen.
//!   Moved entries go to the retry queue or to permanent failure.
//! - **Retry promotion** (every `retry_interval`): takes due retry entries and
//!   re-enqueues them at their original priority with `retryCount + 1`, or
//!   permanently fails them once retries are exhausted.
//!
//! Each cycle runs as its own tokio task so an error or panic inside it is
//! logged and counted without stopping the schedule.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use dispatchq_core::{EntryId, Priority, QueueEntry, QueueMetrics};

use super::config::{ConfigError, QueueManagerConfig};
use super::events::{FailureReason, QUEUE_EVENT_CAPACITY, QueueEvent};
use super::health::{CleanupReport, HealthStatus, ManagerCounters, RetryReport};
use crate::queue_store::{QueueStore, StoreError, StoreEvent};

/// Manager lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ManagerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ManagerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum ManagerError {
    /// The store rejected `connect()` during `start()`.
    #[error("queue store connection failed: {0}")]
    ConnectionFailure(#[source] StoreError),

    #[error("operation not valid while manager is {actual}")]
    InvalidState { actual: ManagerState },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Cleanup,
    RetryPromotion,
}

impl TaskKind {
    fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Cleanup => "stale_cleanup",
            TaskKind::RetryPromotion => "retry_promotion",
        }
    }
}

#[derive(Debug, Default)]
struct ManagerStats {
    last_cleanup_run: Option<DateTime<Utc>>,
    last_retry_process_run: Option<DateTime<Utc>>,
    counters: ManagerCounters,
}

struct BackgroundTasks {
    stop: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
    listener: JoinHandle<()>,
}

struct Inner<S> {
    store: S,
    config: QueueManagerConfig,
    state: AtomicU8,
    stats: RwLock<ManagerStats>,
    events: broadcast::Sender<QueueEvent>,
}

/// Owns a [`QueueStore`] connection and its background maintenance tasks.
///
/// State machine: `Stopped → Starting → Running → Stopping → Stopped`.
pub struct QueueManager<S: QueueStore + 'static> {
    inner: Arc<Inner<S>>,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl<S: QueueStore + 'static> QueueManager<S> {
    /// Create a stopped manager. Fails if the configuration is invalid.
    pub fn new(store: S, config: QueueManagerConfig) -> Result<Self, ManagerError> {
        config.validate()?;
        let (events, _) = broadcast::channel(QUEUE_EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                config,
                state: AtomicU8::new(ManagerState::Stopped as u8),
                stats: RwLock::new(ManagerStats::default()),
                events,
            }),
            tasks: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn config(&self) -> &QueueManagerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ManagerState {
        self.inner.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ManagerState::Running
    }

    /// Subscribe to routing decisions made by the background tasks.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Connect the store and arm both background tasks.
    ///
    /// Only valid from `Stopped`. If the store fails to connect the manager
    /// returns to `Stopped` and the store error is wrapped in
    /// [`ManagerError::ConnectionFailure`].
    #[instrument(skip(self), err)]
    pub async fn start(&self) -> Result<(), ManagerError> {
        self.inner
            .transition(ManagerState::Stopped, ManagerState::Starting)?;
        info!("starting queue manager");

        let store_events = self.inner.store.subscribe();
        if let Err(e) = self.inner.store.connect().await {
            self.inner.set_state(ManagerState::Stopped);
            return Err(ManagerError::ConnectionFailure(e));
        }

        let (stop, stop_rx) = watch::channel(false);
        let config = &self.inner.config;
        let loops = vec![
            spawn_periodic(
                Arc::clone(&self.inner),
                TaskKind::Cleanup,
                config.cleanup_interval,
                stop_rx.clone(),
            ),
            spawn_periodic(
                Arc::clone(&self.inner),
                TaskKind::RetryPromotion,
                config.retry_interval,
                stop_rx.clone(),
            ),
        ];
        let listener = spawn_store_listener(store_events, stop_rx);

        *self.tasks.lock().await = Some(BackgroundTasks {
            stop,
            loops,
            listener,
        });
        self.inner.set_state(ManagerState::Running);

        info!(
            cleanup_interval_ms = config.cleanup_interval.as_millis() as u64,
            retry_interval_ms = config.retry_interval.as_millis() as u64,
            max_retries = config.max_retries,
            "queue manager running"
        );
        Ok(())
    }

    /// Disarm the background tasks, wait for running cycles (bounded by
    /// `graceful_shutdown_timeout`), then disconnect the store.
    ///
    /// No-op when already stopped. The manager always ends up `Stopped`; a
    /// cycle still running when the wait expires finishes detached.
    #[instrument(skip(self), err)]
    pub async fn stop(&self) -> Result<(), ManagerError> {
        match self.state() {
            ManagerState::Stopped => return Ok(()),
            ManagerState::Running => {
                self.inner
                    .transition(ManagerState::Running, ManagerState::Stopping)?;
            }
            actual => return Err(ManagerError::InvalidState { actual }),
        }
        info!("stopping queue manager");

        let tasks = self.tasks.lock().await.take();
        if let Some(tasks) = tasks {
            let _ = tasks.stop.send(true);
            let timeout = self.inner.config.graceful_shutdown_timeout;

            let loops = tasks.loops;
            let drain = async move {
                for handle in loops {
                    if let Err(e) = handle.await {
                        warn!(error = %e, "background task ended abnormally");
                    }
                }
            };
            if tokio::time::timeout(timeout, drain).await.is_err() {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "graceful shutdown timed out, disconnecting with a cycle still running"
                );
            }
            tasks.listener.abort();
        }

        if let Err(e) = self.inner.store.disconnect().await {
            warn!(error = %e, "queue store disconnect failed");
        }
        self.inner.set_state(ManagerState::Stopped);
        info!("queue manager stopped");
        Ok(())
    }

    /// Current health. Never fails; store errors show up as unhealthy fields.
    pub async fn health_status(&self) -> HealthStatus {
        let is_running = self.is_running();
        let store = &self.inner.store;

        let (queue_metrics, store_connected) = match store.queue_metrics().await {
            Ok(metrics) => (Some(metrics), store.is_connected()),
            Err(e) => {
                debug!(error = %e, "health check could not read queue metrics");
                (None, false)
            }
        };
        let (in_flight, retry_depth) = if store_connected {
            (
                store.in_flight_count().await.ok(),
                store.retry_depth().await.ok(),
            )
        } else {
            (None, None)
        };

        let background_tasks_active = self
            .tasks
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| t.loops.iter().all(|h| !h.is_finished()));

        let stats = self.inner.stats.read().await;
        HealthStatus {
            is_running,
            is_healthy: is_running && store_connected && background_tasks_active,
            store_connected,
            background_tasks_active,
            queue_metrics,
            in_flight,
            retry_depth,
            last_cleanup_run: stats.last_cleanup_run,
            last_retry_process_run: stats.last_retry_process_run,
            counters: stats.counters,
        }
    }

    pub async fn counters(&self) -> ManagerCounters {
        self.inner.stats.read().await.counters
    }

    pub async fn queue_metrics(&self) -> Result<QueueMetrics, StoreError> {
        self.inner.store.queue_metrics().await
    }

    pub async fn enqueue(&self, entry: QueueEntry) -> Result<(), StoreError> {
        debug!(entry_id = %entry.id, priority = %entry.priority, "enqueue");
        self.inner.store.enqueue(entry).await
    }

    pub async fn dequeue(&self, priority: Option<Priority>) -> Result<Option<QueueEntry>, StoreError> {
        self.inner.store.dequeue(priority).await
    }

    pub async fn peek(&self, priority: Option<Priority>) -> Result<Option<QueueEntry>, StoreError> {
        self.inner.store.peek(priority).await
    }

    /// Dequeue into the in-flight set; pair with [`acknowledge`](Self::acknowledge).
    pub async fn claim(&self, priority: Option<Priority>) -> Result<Option<QueueEntry>, StoreError> {
        self.inner.store.claim(priority, Utc::now()).await
    }

    pub async fn acknowledge(&self, id: &EntryId) -> Result<bool, StoreError> {
        self.inner.store.acknowledge(id).await
    }

    /// Report a failed claim so the next cleanup cycle reclaims it.
    pub async fn release(&self, id: &EntryId) -> Result<bool, StoreError> {
        self.inner.store.release(id).await
    }

    /// Whether an entry still has retries left.
    pub fn should_retry_request(&self, entry: &QueueEntry) -> bool {
        self.inner.should_retry(entry)
    }

    /// Run one stale-reclamation cycle now.
    pub async fn run_cleanup_cycle(&self) -> Result<CleanupReport, ManagerError> {
        Ok(self.inner.cleanup_cycle().await?)
    }

    /// Run one retry-promotion cycle now.
    pub async fn run_retry_cycle(&self) -> Result<RetryReport, ManagerError> {
        Ok(self.inner.retry_cycle().await?)
    }
}

impl<S: QueueStore + 'static> Drop for QueueManager<S> {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.get_mut().take() {
            let _ = tasks.stop.send(true);
            tasks.listener.abort();
        }
    }
}

impl<S: QueueStore + 'static> Inner<S> {
    fn state(&self) -> ManagerState {
        ManagerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ManagerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: ManagerState, to: ManagerState) -> Result<(), ManagerError> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| ManagerError::InvalidState {
                actual: ManagerState::from_u8(actual),
            })
    }

    fn should_retry(&self, entry: &QueueEntry) -> bool {
        entry.retry_count() < self.config.max_retries
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn run_cycle(self: Arc<Self>, task: TaskKind) -> Result<(), StoreError> {
        match task {
            TaskKind::Cleanup => {
                let report = self.cleanup_cycle().await?;
                if report.scanned > 0 {
                    debug!(
                        task = task.as_str(),
                        scanned = report.scanned,
                        still_in_flight = report.still_in_flight,
                        skipped = report.skipped,
                        scheduled = report.scheduled_for_retry,
                        failed = report.permanently_failed,
                        "cycle complete"
                    );
                }
            }
            TaskKind::RetryPromotion => {
                let report = self.retry_cycle().await?;
                if report.due > 0 {
                    debug!(
                        task = task.as_str(),
                        due = report.due,
                        requeued = report.requeued,
                        failed = report.permanently_failed,
                        "cycle complete"
                    );
                }
            }
        }
        Ok(())
    }

    async fn record_outcome(&self, task: TaskKind, outcome: Result<Result<(), StoreError>, JoinError>) {
        let failed = match outcome {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                error!(task = task.as_str(), error = %e, "background cycle failed");
                true
            }
            Err(e) if e.is_panic() => {
                error!(task = task.as_str(), "background cycle panicked");
                true
            }
            Err(e) => {
                error!(task = task.as_str(), error = %e, "background cycle was cancelled");
                true
            }
        };
        if failed {
            self.stats.write().await.counters.cycle_failures += 1;
        }
    }

    async fn cleanup_cycle(&self) -> Result<CleanupReport, StoreError> {
        let now = Utc::now();
        self.stats.write().await.last_cleanup_run = Some(now);

        let snapshot = self.store.in_flight_snapshot().await?;
        let mut report = CleanupReport {
            scanned: snapshot.len(),
            ..Default::default()
        };
        let timeout_ms = self.config.stale_timeout_ms();
        let mut first_error = None;

        for observed in snapshot {
            if !observed.is_stale(now, timeout_ms) {
                report.still_in_flight += 1;
                continue;
            }

            // Acknowledged, released or re-claimed since the snapshot: leave it
            // to the consumer or the next cycle.
            let entry = match self
                .store
                .reclaim_in_flight(&observed.id, observed.payload.timestamp)
                .await
            {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    debug!(entry_id = %observed.id, "in-flight entry changed during scan, skipped");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    error!(entry_id = %observed.id, error = %e, "failed to reclaim stale entry");
                    first_error.get_or_insert(e);
                    continue;
                }
            };

            if self.should_retry(&entry) {
                let eligible_at = eligible_after(now, self.config.retry_delay_for(entry.retry_count()));
                let (id, priority, retry_count) = (entry.id.clone(), entry.priority, entry.retry_count());

                match self.store.schedule_retry(entry.clone(), eligible_at).await {
                    Ok(()) => {
                        debug!(entry_id = %id, priority = %priority, retry_count, "stale entry scheduled for retry");
                        report.scheduled_for_retry += 1;
                        self.stats.write().await.counters.reclaimed += 1;
                        self.emit(QueueEvent::ScheduledForRetry {
                            entry_id: id,
                            priority,
                            retry_count,
                            eligible_at,
                        });
                    }
                    Err(e) => {
                        error!(entry_id = %id, error = %e, "failed to schedule stale entry for retry");
                        if let Err(restore) = self.store.restore_in_flight(entry).await {
                            error!(entry_id = %id, error = %restore, "stale entry lost");
                        }
                        first_error.get_or_insert(e);
                    }
                }
            } else {
                report.permanently_failed += 1;
                self.permanently_fail(&entry, FailureReason::StaleExhausted).await;
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn retry_cycle(&self) -> Result<RetryReport, StoreError> {
        let now = Utc::now();
        self.stats.write().await.last_retry_process_run = Some(now);

        let due = self.store.take_due_retries(now).await?;
        let mut report = RetryReport {
            due: due.len(),
            ..Default::default()
        };
        let mut first_error = None;

        for retry in due {
            let original = retry.entry;
            if !self.should_retry(&original) {
                report.permanently_failed += 1;
                self.permanently_fail(&original, FailureReason::RetriesExhausted).await;
                continue;
            }

            let mut entry = original.clone();
            entry.payload.retry_count += 1;
            entry.payload.refresh_timestamp(now);
            let (id, priority, retry_count) = (entry.id.clone(), entry.priority, entry.retry_count());

            match self.store.enqueue(entry).await {
                Ok(()) => {
                    debug!(entry_id = %id, priority = %priority, retry_count, "retry entry re-enqueued");
                    report.requeued += 1;
                    self.stats.write().await.counters.retried += 1;
                    self.emit(QueueEvent::Retried {
                        entry_id: id,
                        priority,
                        retry_count,
                    });
                }
                Err(e) => {
                    error!(entry_id = %id, error = %e, "failed to re-enqueue retry entry");
                    if let Err(put_back) = self.store.schedule_retry(original, retry.eligible_at).await {
                        error!(entry_id = %id, error = %put_back, "retry entry lost");
                    }
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn permanently_fail(&self, entry: &QueueEntry, reason: FailureReason) {
        warn!(
            entry_id = %entry.id,
            priority = %entry.priority,
            retry_count = entry.retry_count(),
            max_retries = self.config.max_retries,
            ?reason,
            "request permanently failed"
        );
        self.stats.write().await.counters.permanently_failed += 1;
        self.emit(QueueEvent::PermanentFailure {
            entry_id: entry.id.clone(),
            priority: entry.priority,
            retry_count: entry.retry_count(),
            reason,
        });
    }
}

fn eligible_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn spawn_periodic<S: QueueStore + 'static>(
    inner: Arc<Inner<S>>,
    task: TaskKind,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately; the first cycle runs one period in.
        ticker.tick().await;
        debug!(task = task.as_str(), "background task started");

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }
            if *stop.borrow() {
                break;
            }

            let cycle = tokio::spawn(Arc::clone(&inner).run_cycle(task));
            let outcome = cycle.await;
            inner.record_outcome(task, outcome).await;
        }

        debug!(task = task.as_str(), "background task stopped");
    })
}

fn spawn_store_listener(
    mut events: broadcast::Receiver<StoreEvent>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                event = events.recv() => match event {
                    Ok(StoreEvent::Connected) => info!("queue store connected"),
                    Ok(StoreEvent::Disconnected) => info!("queue store disconnected"),
                    Ok(StoreEvent::Error(e)) => warn!(error = %e, "queue store reported an error"),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "store event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}
