use chrono::{DateTime, Utc};
use serde::Serialize;

use dispatchq_core::QueueMetrics;

/// Cumulative background-task counters since the manager was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerCounters {
    /// Stalled entries moved from in-flight to the retry queue
    pub reclaimed: u64,
    /// Retry entries re-enqueued into their tier
    pub retried: u64,
    pub permanently_failed: u64,
    /// Cycles that returned an error or panicked
    pub cycle_failures: u64,
}

/// Outcome of one stale-reclamation cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub scanned: usize,
    /// Younger than the stale timeout, left in flight
    pub still_in_flight: usize,
    /// Acknowledged, released or re-claimed while the cycle ran
    pub skipped: usize,
    pub scheduled_for_retry: usize,
    pub permanently_failed: usize,
}

/// Outcome of one retry-promotion cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryReport {
    pub due: usize,
    pub requeued: usize,
    pub permanently_failed: usize,
}

/// Point-in-time health of a [`QueueManager`](super::QueueManager).
///
/// `is_healthy` requires a running manager, live background tasks and a
/// successful metrics read. A failed metrics read reports the store as
/// disconnected and leaves the store-derived fields empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub is_running: bool,
    pub is_healthy: bool,
    pub store_connected: bool,
    pub background_tasks_active: bool,
    pub queue_metrics: Option<QueueMetrics>,
    pub in_flight: Option<usize>,
    pub retry_depth: Option<usize>,
    pub last_cleanup_run: Option<DateTime<Utc>>,
    pub last_retry_process_run: Option<DateTime<Utc>>,
    pub counters: ManagerCounters,
}
