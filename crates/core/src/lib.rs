//! `dispatchq-core`: queue model building blocks.
//!
//! This crate contains the **pure** queue model (no infrastructure concerns):
//! entries, priority tiers, identifiers and derived metrics.

pub mod entry;
pub mod error;
pub mod id;
pub mod metrics;
pub mod priority;

pub use entry::{QueueEntry, RequestPayload, now_millis};
pub use error::{DomainError, DomainResult};
pub use id::EntryId;
pub use metrics::{QueueMetrics, TierDepths};
pub use priority::Priority;
