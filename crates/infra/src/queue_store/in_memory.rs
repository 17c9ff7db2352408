use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};

use dispatchq_core::{EntryId, Priority, QueueEntry, QueueMetrics, TierDepths};

use super::r#trait::{QueueStore, RetryEntry, STORE_EVENT_CAPACITY, StoreError, StoreEvent};

/// Retry queue key: eligibility time, then insertion sequence for FIFO ties.
type RetryKey = (DateTime<Utc>, u64);

#[derive(Debug, Default)]
struct StoreState {
    tiers: [VecDeque<QueueEntry>; 3],
    in_flight: HashMap<EntryId, QueueEntry>,
    retry: BTreeMap<RetryKey, RetryEntry>,
    next_retry_seq: u64,
}

impl StoreState {
    fn tier(&self, priority: Priority) -> &VecDeque<QueueEntry> {
        &self.tiers[priority.rank()]
    }

    fn tier_mut(&mut self, priority: Priority) -> &mut VecDeque<QueueEntry> {
        &mut self.tiers[priority.rank()]
    }

    /// Tier selected by the dequeue rule.
    fn select(&self, priority: Option<Priority>) -> Option<Priority> {
        match priority {
            Some(p) => (!self.tier(p).is_empty()).then_some(p),
            None => Priority::ALL
                .into_iter()
                .find(|p| !self.tier(*p).is_empty()),
        }
    }

    fn pop(&mut self, priority: Option<Priority>) -> Option<QueueEntry> {
        let tier = self.select(priority)?;
        self.tier_mut(tier).pop_front()
    }

    fn depths(&self) -> TierDepths {
        let mut depths = TierDepths::default();
        for p in Priority::ALL {
            depths.set(p, self.tier(p).len());
        }
        depths
    }
}

/// In-memory queue store for tests/dev.
///
/// Not durable. `set_unreachable` simulates a backend outage: while set,
/// `connect` fails and every data operation returns a backend error, which is
/// how the manager's fault isolation is exercised in tests.
#[derive(Debug)]
pub struct InMemoryQueueStore {
    state: RwLock<StoreState>,
    connected: AtomicBool,
    unreachable: AtomicBool,
    events: broadcast::Sender<StoreEvent>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(STORE_EVENT_CAPACITY);
        Self {
            state: RwLock::new(StoreState::default()),
            connected: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            events,
        }
    }

    /// Simulate the backend becoming unreachable (or recovering).
    pub fn set_unreachable(&self, unreachable: bool) {
        let was = self.unreachable.swap(unreachable, Ordering::SeqCst);
        if unreachable && !was {
            let _ = self
                .events
                .send(StoreEvent::Error("simulated outage".to_string()));
        }
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::backend("simulated outage"));
        }
        Ok(())
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn connect(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            let err = StoreError::connection("simulated outage");
            let _ = self.events.send(StoreEvent::Error(err.to_string()));
            return Err(err);
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(StoreEvent::Connected);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(StoreEvent::Disconnected);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    async fn enqueue(&self, entry: QueueEntry) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        debug!(entry_id = %entry.id, priority = %entry.priority, "enqueue");
        state.tier_mut(entry.priority).push_back(entry);
        Ok(())
    }

    async fn dequeue(&self, priority: Option<Priority>) -> Result<Option<QueueEntry>, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        Ok(state.pop(priority))
    }

    async fn peek(&self, priority: Option<Priority>) -> Result<Option<QueueEntry>, StoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(state
            .select(priority)
            .and_then(|p| state.tier(p).front().cloned()))
    }

    async fn claim(
        &self,
        priority: Option<Priority>,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueEntry>, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let Some(mut entry) = state.pop(priority) else {
            return Ok(None);
        };
        entry.payload.refresh_timestamp(now);
        if state.in_flight.insert(entry.id.clone(), entry.clone()).is_some() {
            warn!(entry_id = %entry.id, "claimed id was already in flight, earlier claim replaced");
        }
        Ok(Some(entry))
    }

    async fn acknowledge(&self, id: &EntryId) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        Ok(state.in_flight.remove(id).is_some())
    }

    async fn release(&self, id: &EntryId) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        match state.in_flight.get_mut(id) {
            Some(entry) => {
                entry.payload.timestamp = 0;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn in_flight_snapshot(&self) -> Result<Vec<QueueEntry>, StoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(state.in_flight.values().cloned().collect())
    }

    async fn reclaim_in_flight(
        &self,
        id: &EntryId,
        observed_timestamp: i64,
    ) -> Result<Option<QueueEntry>, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let unchanged = state
            .in_flight
            .get(id)
            .is_some_and(|e| e.payload.timestamp == observed_timestamp);
        Ok(if unchanged { state.in_flight.remove(id) } else { None })
    }

    async fn restore_in_flight(&self, entry: QueueEntry) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let id = entry.id.clone();
        if state.in_flight.insert(id.clone(), entry).is_some() {
            warn!(entry_id = %id, "restored id was already in flight, earlier copy replaced");
        }
        Ok(())
    }

    async fn in_flight_count(&self) -> Result<usize, StoreError> {
        self.ensure_available()?;
        Ok(self.state.read().await.in_flight.len())
    }

    async fn schedule_retry(
        &self,
        entry: QueueEntry,
        eligible_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let seq = state.next_retry_seq;
        state.next_retry_seq += 1;
        state.retry.insert(
            (eligible_at, seq),
            RetryEntry {
                entry,
                enqueued_at: Utc::now(),
                eligible_at,
            },
        );
        Ok(())
    }

    async fn take_due_retries(&self, now: DateTime<Utc>) -> Result<Vec<RetryEntry>, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let mut due = Vec::new();
        while let Some(first) = state.retry.first_entry() {
            if first.key().0 > now {
                break;
            }
            due.push(first.remove());
        }
        Ok(due)
    }

    async fn retry_depth(&self) -> Result<usize, StoreError> {
        self.ensure_available()?;
        Ok(self.state.read().await.retry.len())
    }

    async fn queue_depth(&self, priority: Priority) -> Result<usize, StoreError> {
        self.ensure_available()?;
        Ok(self.state.read().await.tier(priority).len())
    }

    async fn queue_metrics(&self) -> Result<QueueMetrics, StoreError> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(QueueMetrics::from_depths(state.depths()))
    }
}
