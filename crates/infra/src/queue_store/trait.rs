use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast;

use dispatchq_core::{DomainError, EntryId, Priority, QueueEntry, QueueMetrics};

/// Queue store operation error.
///
/// These are **infrastructure errors** (connectivity, backend I/O, encoding) as
/// opposed to domain errors. The store never retries internally; retry is a
/// manager policy.
///
/// ## Error Categories
///
/// - **Unavailable**: operation attempted while disconnected
/// - **Connection**: establishing the connection failed
/// - **Backend**: the backend rejected or failed a command (transient I/O)
/// - **Serialization**: a stored entry could not be encoded or decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("queue store unavailable")]
    Unavailable,

    #[error("queue store connection failed: {0}")]
    Connection(String),

    #[error("queue store backend error: {0}")]
    Backend(String),

    #[error("queue entry serialization failed: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Whether the error means the store cannot currently be reached.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, StoreError::Unavailable | StoreError::Connection(_))
    }
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        StoreError::Serialization(value.to_string())
    }
}

/// Connection-state change surfaced by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Connected,
    Disconnected,
    Error(String),
}

/// Capacity of the per-store event broadcast.
pub const STORE_EVENT_CAPACITY: usize = 64;

/// An entry waiting in the retry queue.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryEntry {
    pub entry: QueueEntry,
    /// When the entry was placed into the retry queue.
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the entry may be promoted back into its tier.
    pub eligible_at: DateTime<Utc>,
}

/// Persistent, priority-partitioned FIFO queue.
///
/// The store is a **data-movement primitive**: it holds entries in three tiers,
/// an in-flight set and a retry queue, and owns no retry or timeout policy.
///
/// ## Selection Rule
///
/// `dequeue`, `peek` and `claim` with `priority = None` select the head of the
/// highest-priority non-empty tier (HIGH, then NORMAL, then LOW). With
/// `Some(p)` only tier `p` is considered. An empty selection is `Ok(None)`.
///
/// ## Placement Invariant
///
/// An entry is in exactly one of {tier, in-flight set, retry queue} at any
/// time. Every operation moving an entry removes it from its source before it
/// becomes visible at its destination.
///
/// ## Connection Semantics
///
/// - `connect` and `disconnect` are idempotent
/// - `disconnect` releases resources even if `connect` never succeeded
/// - every other operation fails with [`StoreError::Unavailable`] while
///   disconnected
/// - backend errors surface unchanged
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn connect(&self) -> Result<(), StoreError>;

    async fn disconnect(&self) -> Result<(), StoreError>;

    fn is_connected(&self) -> bool;

    /// Subscribe to connection-state changes.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;

    /// Append to the tail of the entry's tier.
    async fn enqueue(&self, entry: QueueEntry) -> Result<(), StoreError>;

    /// Remove and return the selected head entry.
    async fn dequeue(&self, priority: Option<Priority>) -> Result<Option<QueueEntry>, StoreError>;

    /// Return the selected head entry without removing it.
    async fn peek(&self, priority: Option<Priority>) -> Result<Option<QueueEntry>, StoreError>;

    /// Like `dequeue`, but the entry moves into the in-flight set with its
    /// timestamp refreshed to `now`.
    async fn claim(
        &self,
        priority: Option<Priority>,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueEntry>, StoreError>;

    /// Drop a claimed entry from the in-flight set. Returns whether it was there.
    async fn acknowledge(&self, id: &EntryId) -> Result<bool, StoreError>;

    /// Backdate a claimed entry so the next stale scan reclaims it. Returns
    /// whether it was in flight.
    async fn release(&self, id: &EntryId) -> Result<bool, StoreError>;

    /// Copy of the in-flight set. Entries stay in flight; each carries the
    /// timestamp the store currently holds for it.
    async fn in_flight_snapshot(&self) -> Result<Vec<QueueEntry>, StoreError>;

    /// Remove an in-flight entry only if its stored timestamp still equals
    /// `observed_timestamp`. Returns `None` when the entry was acknowledged,
    /// released or re-claimed since it was observed.
    async fn reclaim_in_flight(
        &self,
        id: &EntryId,
        observed_timestamp: i64,
    ) -> Result<Option<QueueEntry>, StoreError>;

    /// Put an entry into the in-flight set unchanged.
    async fn restore_in_flight(&self, entry: QueueEntry) -> Result<(), StoreError>;

    async fn in_flight_count(&self) -> Result<usize, StoreError>;

    /// Place an entry into the retry queue.
    async fn schedule_retry(
        &self,
        entry: QueueEntry,
        eligible_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Remove and return retry entries with `eligible_at <= now`, earliest first.
    async fn take_due_retries(&self, now: DateTime<Utc>) -> Result<Vec<RetryEntry>, StoreError>;

    async fn retry_depth(&self) -> Result<usize, StoreError>;

    async fn queue_depth(&self, priority: Priority) -> Result<usize, StoreError>;

    async fn total_queue_depth(&self) -> Result<usize, StoreError> {
        Ok(self.queue_metrics().await?.total_depth)
    }

    /// Consistent snapshot of all three tiers.
    async fn queue_metrics(&self) -> Result<QueueMetrics, StoreError>;

    async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.total_queue_depth().await? == 0)
    }
}

#[async_trait]
impl<S> QueueStore for Arc<S>
where
    S: QueueStore + ?Sized,
{
    async fn connect(&self) -> Result<(), StoreError> {
        (**self).connect().await
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        (**self).disconnect().await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        (**self).subscribe()
    }

    async fn enqueue(&self, entry: QueueEntry) -> Result<(), StoreError> {
        (**self).enqueue(entry).await
    }

    async fn dequeue(&self, priority: Option<Priority>) -> Result<Option<QueueEntry>, StoreError> {
        (**self).dequeue(priority).await
    }

    async fn peek(&self, priority: Option<Priority>) -> Result<Option<QueueEntry>, StoreError> {
        (**self).peek(priority).await
    }

    async fn claim(
        &self,
        priority: Option<Priority>,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueEntry>, StoreError> {
        (**self).claim(priority, now).await
    }

    async fn acknowledge(&self, id: &EntryId) -> Result<bool, StoreError> {
        (**self).acknowledge(id).await
    }

    async fn release(&self, id: &EntryId) -> Result<bool, StoreError> {
        (**self).release(id).await
    }

    async fn in_flight_snapshot(&self) -> Result<Vec<QueueEntry>, StoreError> {
        (**self).in_flight_snapshot().await
    }

    async fn reclaim_in_flight(
        &self,
        id: &EntryId,
        observed_timestamp: i64,
    ) -> Result<Option<QueueEntry>, StoreError> {
        (**self).reclaim_in_flight(id, observed_timestamp).await
    }

    async fn restore_in_flight(&self, entry: QueueEntry) -> Result<(), StoreError> {
        (**self).restore_in_flight(entry).await
    }

    async fn in_flight_count(&self) -> Result<usize, StoreError> {
        (**self).in_flight_count().await
    }

    async fn schedule_retry(
        &self,
        entry: QueueEntry,
        eligible_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self).schedule_retry(entry, eligible_at).await
    }

    async fn take_due_retries(&self, now: DateTime<Utc>) -> Result<Vec<RetryEntry>, StoreError> {
        (**self).take_due_retries(now).await
    }

    async fn retry_depth(&self) -> Result<usize, StoreError> {
        (**self).retry_depth().await
    }

    async fn queue_depth(&self, priority: Priority) -> Result<usize, StoreError> {
        (**self).queue_depth(priority).await
    }

    async fn total_queue_depth(&self) -> Result<usize, StoreError> {
        (**self).total_queue_depth().await
    }

    async fn queue_metrics(&self) -> Result<QueueMetrics, StoreError> {
        (**self).queue_metrics().await
    }

    async fn is_empty(&self) -> Result<bool, StoreError> {
        (**self).is_empty().await
    }
}
