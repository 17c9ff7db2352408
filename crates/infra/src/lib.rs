//! Infrastructure layer: queue stores (in-memory, Redis) and the queue manager.

pub mod manager;
pub mod queue_store;

pub use manager::{
    BackoffStrategy, ConfigError, HealthStatus, ManagerError, ManagerState, QueueEvent, QueueManager,
    QueueManagerConfig,
};
pub use queue_store::{InMemoryQueueStore, QueueStore, StoreError, StoreEvent};

#[cfg(test)]
mod integration_tests;
