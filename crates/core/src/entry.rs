//! Queue entries: the unit of work moved between tiers, the in-flight set and
//! the retry queue.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::DomainError;
use crate::id::EntryId;
use crate::priority::Priority;

/// Reserved payload keys owned by the queue.
pub const TIMESTAMP_KEY: &str = "timestamp";
pub const RETRY_COUNT_KEY: &str = "retryCount";

/// Opaque request payload with the two fields the queue cares about.
///
/// Everything besides `timestamp` and `retryCount` is carried through
/// untouched, so producers can embed provider-specific request data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    /// Creation or last-dispatch time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Attempts already consumed by retries. Starts at 0.
    #[serde(default)]
    pub retry_count: u32,
    /// Caller data.
    #[serde(flatten)]
    pub data: Map<String, JsonValue>,
}

impl RequestPayload {
    /// Build a payload stamped with the current time.
    ///
    /// A JSON object is flattened into the payload; any other value is kept
    /// under a `data` key. Reserved keys in the caller data are dropped.
    pub fn new(data: JsonValue) -> Self {
        let mut map = match data {
            JsonValue::Object(map) => map,
            JsonValue::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        map.remove(TIMESTAMP_KEY);
        map.remove(RETRY_COUNT_KEY);

        Self {
            timestamp: now_millis(),
            retry_count: 0,
            data: map,
        }
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = timestamp_ms;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Stamp the payload with `now`.
    pub fn refresh_timestamp(&mut self, now: DateTime<Utc>) {
        self.timestamp = now.timestamp_millis();
    }

    /// Milliseconds elapsed between `timestamp` and `now` (negative if the
    /// timestamp lies in the future). Saturates for out-of-range timestamps.
    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp_millis().saturating_sub(self.timestamp)
    }

    /// The embedded timestamp as a `DateTime`, if it is representable.
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }
}

impl Default for RequestPayload {
    fn default() -> Self {
        Self::new(JsonValue::Null)
    }
}

/// A unit of work held by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub payload: RequestPayload,
    pub priority: Priority,
}

impl QueueEntry {
    pub fn new(id: EntryId, priority: Priority, payload: RequestPayload) -> Self {
        Self {
            id,
            payload,
            priority,
        }
    }

    /// Convenience constructor from raw parts.
    pub fn from_parts(
        id: impl Into<String>,
        priority: Priority,
        data: JsonValue,
    ) -> Result<Self, DomainError> {
        Ok(Self::new(EntryId::new(id)?, priority, RequestPayload::new(data)))
    }

    pub fn retry_count(&self) -> u32 {
        self.payload.retry_count
    }

    /// Whether the entry has been in its current state for at least
    /// `timeout_ms` milliseconds.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout_ms: i64) -> bool {
        self.payload.age_ms(now) >= timeout_ms
    }

    /// Serialize to the JSON form stored by durable backends.
    pub fn to_json(&self) -> Result<String, DomainError> {
        serde_json::to_string(self).map_err(|e| DomainError::validation(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, DomainError> {
        serde_json::from_str(raw).map_err(|e| DomainError::validation(e.to_string()))
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
