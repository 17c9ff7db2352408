//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures of the queue model itself
/// (malformed identifiers, unknown priority tags, bad payloads). Store and
/// scheduling failures belong to the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. empty or too long).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A priority tag did not name one of the three tiers.
    #[error("unknown priority: {0}")]
    UnknownPriority(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_priority(tag: impl Into<String>) -> Self {
        Self::UnknownPriority(tag.into())
    }
}
