//! Redis-backed queue store (durable, priority-partitioned).
//!
//! ## Layout
//!
//! - **Tiers**: `{prefix}:queue:high|normal|low` lists (RPUSH tail, LPOP head)
//! - **In-flight**: `{prefix}:inflight` hash (id → entry JSON) plus
//!   `{prefix}:inflight:claimed` hash (id → dispatch time in ms)
//! - **Retry queue**: `{prefix}:retry` sorted set scored by eligibility ms
//!
//! Multi-key moves run as Lua scripts or `MULTI` pipelines so an entry is
//! never visible in two places at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, instrument, warn};

use dispatchq_core::{EntryId, Priority, QueueEntry, QueueMetrics, TierDepths};

use super::r#trait::{QueueStore, RetryEntry, STORE_EVENT_CAPACITY, StoreError, StoreEvent};

/// Default key prefix
pub const DEFAULT_KEY_PREFIX: &str = "dispatchq";

/// Max retry entries promoted per `take_due_retries` call
const RETRY_BATCH: usize = 500;

/// Pop the head of the first non-empty list among KEYS.
const POP_SCRIPT: &str = r#"
for i = 1, #KEYS do
  local raw = redis.call('LPOP', KEYS[i])
  if raw then
    return raw
  end
end
return false
"#;

/// Pop like POP_SCRIPT, then track the entry in flight.
/// KEYS: tiers..., inflight hash, claimed hash. ARGV[1]: now (ms).
const CLAIM_SCRIPT: &str = r#"
local n = #KEYS - 2
for i = 1, n do
  local raw = redis.call('LPOP', KEYS[i])
  if raw then
    local id = cjson.decode(raw)['id']
    local added = redis.call('HSET', KEYS[n + 1], id, raw)
    redis.call('HSET', KEYS[n + 2], id, ARGV[1])
    return {raw, added}
  end
end
return false
"#;

/// Remove an in-flight entry if its dispatch time still matches.
/// KEYS: inflight hash, claimed hash. ARGV[1]: id, ARGV[2]: observed ms.
const RECLAIM_SCRIPT: &str = r#"
local claimed = redis.call('HGET', KEYS[2], ARGV[1])
if claimed and claimed ~= ARGV[2] then
  return false
end
local raw = redis.call('HGET', KEYS[1], ARGV[1])
if not raw then
  return false
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
return raw
"#;

/// KEYS: inflight hash, claimed hash. ARGV[1]: id.
const RELEASE_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1 then
  redis.call('HSET', KEYS[2], ARGV[1], '0')
  return 1
end
return 0
"#;

/// KEYS: retry zset. ARGV[1]: now (ms), ARGV[2]: batch size.
const TAKE_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'WITHSCORES', 'LIMIT', 0, ARGV[2])
for i = 1, #due, 2 do
  redis.call('ZREM', KEYS[1], due[i])
end
return due
"#;

/// Retry queue member. `enqueued_at` also keeps members unique when the same
/// entry is scheduled twice.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetryRecord {
    entry: QueueEntry,
    enqueued_at: i64,
}

#[derive(Debug, Clone)]
struct Keys {
    tiers: [String; 3],
    in_flight: String,
    claimed: String,
    retry: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        Self {
            tiers: Priority::ALL.map(|p| format!("{prefix}:queue:{}", p.key_suffix())),
            in_flight: format!("{prefix}:inflight"),
            claimed: format!("{prefix}:inflight:claimed"),
            retry: format!("{prefix}:retry"),
        }
    }

    fn tier(&self, priority: Priority) -> &str {
        &self.tiers[priority.rank()]
    }

    /// Tier keys in selection order.
    fn selection(&self, priority: Option<Priority>) -> Vec<&str> {
        match priority {
            Some(p) => vec![self.tier(p)],
            None => self.tiers.iter().map(String::as_str).collect(),
        }
    }
}

/// Redis queue store.
pub struct RedisQueueStore {
    client: redis::Client,
    keys: Keys,
    conn: RwLock<Option<ConnectionManager>>,
    connected: AtomicBool,
    events: broadcast::Sender<StoreEvent>,
    pop_script: redis::Script,
    claim_script: redis::Script,
    release_script: redis::Script,
    reclaim_script: redis::Script,
    take_due_script: redis::Script,
}

impl std::fmt::Debug for RedisQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueueStore")
            .field("keys", &self.keys)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

impl RedisQueueStore {
    /// Create a store for `redis_url` (e.g. "redis://localhost:6379").
    ///
    /// Only parses the URL; no connection is made until `connect`.
    pub fn new(redis_url: impl AsRef<str>, key_prefix: Option<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::connection(e.to_string()))?;
        let prefix = key_prefix.unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());
        let (events, _) = broadcast::channel(STORE_EVENT_CAPACITY);

        Ok(Self {
            client,
            keys: Keys::new(&prefix),
            conn: RwLock::new(None),
            connected: AtomicBool::new(false),
            events,
            pop_script: redis::Script::new(POP_SCRIPT),
            claim_script: redis::Script::new(CLAIM_SCRIPT),
            release_script: redis::Script::new(RELEASE_SCRIPT),
            reclaim_script: redis::Script::new(RECLAIM_SCRIPT),
            take_due_script: redis::Script::new(TAKE_DUE_SCRIPT),
        })
    }

    async fn conn(&self) -> Result<ConnectionManager, StoreError> {
        self.conn
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or(StoreError::Unavailable)
    }

    fn backend_error(&self, op: &str, e: redis::RedisError) -> StoreError {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            let _ = self.events.send(StoreEvent::Error(e.to_string()));
        }
        StoreError::backend(format!("{op} failed: {e}"))
    }

    fn decode_entry(raw: &str) -> Result<QueueEntry, StoreError> {
        Ok(QueueEntry::from_json(raw)?)
    }

    async fn pop(&self, priority: Option<Priority>) -> Result<Option<QueueEntry>, StoreError> {
        let mut conn = self.conn().await?;
        let mut invocation = self.pop_script.prepare_invoke();
        for key in self.keys.selection(priority) {
            invocation.key(key);
        }
        let raw: Option<String> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.backend_error("dequeue", e))?;
        raw.as_deref().map(Self::decode_entry).transpose()
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    #[instrument(skip(self), err)]
    async fn connect(&self) -> Result<(), StoreError> {
        let mut slot = self.conn.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let attempt = async {
            let mut conn = self.client.get_connection_manager().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, redis::RedisError>(conn)
        };

        match attempt.await {
            Ok(conn) => {
                *slot = Some(conn);
                self.connected.store(true, Ordering::SeqCst);
                let _ = self.events.send(StoreEvent::Connected);
                info!(keys = ?self.keys.tiers, "redis queue store connected");
                Ok(())
            }
            Err(e) => {
                let err = StoreError::connection(e.to_string());
                let _ = self.events.send(StoreEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        let previous = self.conn.write().await.take();
        self.connected.store(false, Ordering::SeqCst);
        if previous.is_some() {
            let _ = self.events.send(StoreEvent::Disconnected);
            info!("redis queue store disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    #[instrument(skip(self, entry), fields(entry_id = %entry.id, priority = %entry.priority), err)]
    async fn enqueue(&self, entry: QueueEntry) -> Result<(), StoreError> {
        let raw = entry.to_json()?;
        let mut conn = self.conn().await?;
        let _: i64 = conn
            .rpush(self.keys.tier(entry.priority), raw)
            .await
            .map_err(|e| self.backend_error("RPUSH", e))?;
        Ok(())
    }

    async fn dequeue(&self, priority: Option<Priority>) -> Result<Option<QueueEntry>, StoreError> {
        self.pop(priority).await
    }

    async fn peek(&self, priority: Option<Priority>) -> Result<Option<QueueEntry>, StoreError> {
        let mut conn = self.conn().await?;
        for key in self.keys.selection(priority) {
            let raw: Option<String> = conn
                .lindex(key, 0)
                .await
                .map_err(|e| self.backend_error("LINDEX", e))?;
            if let Some(raw) = raw {
                return Self::decode_entry(&raw).map(Some);
            }
        }
        Ok(None)
    }

    async fn claim(
        &self,
        priority: Option<Priority>,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueEntry>, StoreError> {
        let mut conn = self.conn().await?;
        let mut invocation = self.claim_script.prepare_invoke();
        for key in self.keys.selection(priority) {
            invocation.key(key);
        }
        invocation
            .key(&self.keys.in_flight)
            .key(&self.keys.claimed)
            .arg(now.timestamp_millis());

        let claimed: Option<(String, i64)> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.backend_error("claim", e))?;

        let Some((raw, added)) = claimed else {
            return Ok(None);
        };
        let mut entry = Self::decode_entry(&raw)?;
        if added == 0 {
            warn!(entry_id = %entry.id, "claimed id was already in flight, earlier claim replaced");
        }
        entry.payload.refresh_timestamp(now);
        debug!(entry_id = %entry.id, priority = %entry.priority, "claimed");
        Ok(Some(entry))
    }

    async fn acknowledge(&self, id: &EntryId) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let (removed, _): (i64, i64) = redis::pipe()
            .atomic()
            .hdel(&self.keys.in_flight, id.as_str())
            .hdel(&self.keys.claimed, id.as_str())
            .query_async(&mut conn)
            .await
            .map_err(|e| self.backend_error("acknowledge", e))?;
        Ok(removed > 0)
    }

    async fn release(&self, id: &EntryId) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let released: i64 = self
            .release_script
            .key(&self.keys.in_flight)
            .key(&self.keys.claimed)
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.backend_error("release", e))?;
        Ok(released == 1)
    }

    async fn in_flight_snapshot(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let mut conn = self.conn().await?;
        let (entries, claimed): (HashMap<String, String>, HashMap<String, i64>) = redis::pipe()
            .atomic()
            .hgetall(&self.keys.in_flight)
            .hgetall(&self.keys.claimed)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.backend_error("in_flight_snapshot", e))?;

        let mut snapshot = Vec::with_capacity(entries.len());
        for (id, raw) in entries {
            match Self::decode_entry(&raw) {
                Ok(mut entry) => {
                    if let Some(ts) = claimed.get(&id) {
                        entry.payload.timestamp = *ts;
                    }
                    snapshot.push(entry);
                }
                Err(e) => warn!(entry_id = %id, error = %e, "skipping undecodable in-flight entry"),
            }
        }
        Ok(snapshot)
    }

    async fn reclaim_in_flight(
        &self,
        id: &EntryId,
        observed_timestamp: i64,
    ) -> Result<Option<QueueEntry>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = self
            .reclaim_script
            .key(&self.keys.in_flight)
            .key(&self.keys.claimed)
            .arg(id.as_str())
            .arg(observed_timestamp)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.backend_error("reclaim_in_flight", e))?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut entry = Self::decode_entry(&raw)?;
        entry.payload.timestamp = observed_timestamp;
        Ok(Some(entry))
    }

    async fn restore_in_flight(&self, entry: QueueEntry) -> Result<(), StoreError> {
        let raw = entry.to_json()?;
        let mut conn = self.conn().await?;
        let (added,): (i64,) = redis::pipe()
            .atomic()
            .hset(&self.keys.in_flight, entry.id.as_str(), raw)
            .hset(&self.keys.claimed, entry.id.as_str(), entry.payload.timestamp)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| self.backend_error("restore_in_flight", e))?;
        if added == 0 {
            warn!(entry_id = %entry.id, "restored id was already in flight, earlier copy replaced");
        }
        Ok(())
    }

    async fn in_flight_count(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn().await?;
        conn.hlen(&self.keys.in_flight)
            .await
            .map_err(|e| self.backend_error("HLEN", e))
    }

    async fn schedule_retry(
        &self,
        entry: QueueEntry,
        eligible_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let record = RetryRecord {
            entry,
            enqueued_at: Utc::now().timestamp_millis(),
        };
        let member = serde_json::to_string(&record)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut conn = self.conn().await?;
        let _: i64 = conn
            .zadd(&self.keys.retry, member, eligible_at.timestamp_millis())
            .await
            .map_err(|e| self.backend_error("ZADD", e))?;
        Ok(())
    }

    async fn take_due_retries(&self, now: DateTime<Utc>) -> Result<Vec<RetryEntry>, StoreError> {
        let mut conn = self.conn().await?;
        let due: Vec<(String, f64)> = self
            .take_due_script
            .key(&self.keys.retry)
            .arg(now.timestamp_millis())
            .arg(RETRY_BATCH)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.backend_error("take_due_retries", e))?;

        let mut taken = Vec::with_capacity(due.len());
        for (member, score) in due {
            let record: RetryRecord = match serde_json::from_str(&member) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable retry entry");
                    continue;
                }
            };
            taken.push(RetryEntry {
                entry: record.entry,
                enqueued_at: millis_to_utc(record.enqueued_at),
                eligible_at: millis_to_utc(score as i64),
            });
        }
        Ok(taken)
    }

    async fn retry_depth(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn().await?;
        conn.zcard(&self.keys.retry)
            .await
            .map_err(|e| self.backend_error("ZCARD", e))
    }

    async fn queue_depth(&self, priority: Priority) -> Result<usize, StoreError> {
        let mut conn = self.conn().await?;
        conn.llen(self.keys.tier(priority))
            .await
            .map_err(|e| self.backend_error("LLEN", e))
    }

    async fn queue_metrics(&self) -> Result<QueueMetrics, StoreError> {
        let mut conn = self.conn().await?;
        let (high, normal, low): (usize, usize, usize) = redis::pipe()
            .atomic()
            .llen(self.keys.tier(Priority::High))
            .llen(self.keys.tier(Priority::Normal))
            .llen(self.keys.tier(Priority::Low))
            .query_async(&mut conn)
            .await
            .map_err(|e| self.backend_error("queue_metrics", e))?;
        Ok(QueueMetrics::from_depths(TierDepths::new(high, normal, low)))
    }
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
