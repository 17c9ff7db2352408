//! Strongly-typed identifiers used across the queue.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Upper bound on identifier length; ids double as Redis hash fields.
pub const MAX_ENTRY_ID_LEN: usize = 256;

/// Identifier of a queue entry.
///
/// Caller-assigned and opaque to the queue. It must stay unique across the
/// whole system for as long as the entry lives (main tier, in flight, or
/// waiting for a retry).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    /// Wrap a caller-provided identifier, rejecting empty or oversized ids.
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(DomainError::invalid_id("EntryId: must not be empty"));
        }
        if id.len() > MAX_ENTRY_ID_LEN {
            return Err(DomainError::invalid_id(format!(
                "EntryId: length {} exceeds {}",
                id.len(),
                MAX_ENTRY_ID_LEN
            )));
        }
        Ok(Self(id))
    }

    /// Generate a fresh identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Producers that already own a request id
    /// should pass it through `new` instead.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl core::fmt::Display for EntryId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntryId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for EntryId {
    type Error = DomainError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for EntryId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntryId> for String {
    fn from(value: EntryId) -> Self {
        value.0
    }
}

impl AsRef<str> for EntryId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
