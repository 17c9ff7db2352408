use chrono::{DateTime, Utc};
use serde::Serialize;

use dispatchq_core::{EntryId, Priority};

/// Capacity of the manager's event broadcast. Slow subscribers lag, they never
/// block the background tasks.
pub const QUEUE_EVENT_CAPACITY: usize = 256;

/// Why an entry was permanently failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Stalled in flight with no retries left
    StaleExhausted,
    /// Reached promotion with no retries left
    RetriesExhausted,
}

/// Routing decision taken by a background cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum QueueEvent {
    /// A stalled in-flight entry moved to the retry queue.
    #[serde(rename_all = "camelCase")]
    ScheduledForRetry {
        entry_id: EntryId,
        priority: Priority,
        retry_count: u32,
        eligible_at: DateTime<Utc>,
    },

    /// A due retry entry was re-enqueued into its tier.
    #[serde(rename_all = "camelCase")]
    Retried {
        entry_id: EntryId,
        priority: Priority,
        retry_count: u32,
    },

    /// An entry was discarded after exhausting its retries.
    #[serde(rename_all = "camelCase")]
    PermanentFailure {
        entry_id: EntryId,
        priority: Priority,
        retry_count: u32,
        reason: FailureReason,
    },
}

impl QueueEvent {
    pub fn entry_id(&self) -> &EntryId {
        match self {
            QueueEvent::ScheduledForRetry { entry_id, .. }
            | QueueEvent::Retried { entry_id, .. }
            | QueueEvent::PermanentFailure { entry_id, .. } => entry_id,
        }
    }
}
