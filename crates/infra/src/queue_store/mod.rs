//! Tiered queue store: trait plus in-memory and Redis implementations.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod r#trait;

pub use in_memory::InMemoryQueueStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisQueueStore;
pub use r#trait::{QueueStore, RetryEntry, StoreError, StoreEvent};
