//! Queue manager: lifecycle, stale reclamation, retry promotion and health.

pub mod config;
pub mod events;
pub mod health;
pub mod queue_manager;

pub use config::{BackoffStrategy, ConfigError, QueueManagerConfig};
pub use events::{FailureReason, QueueEvent};
pub use health::{CleanupReport, HealthStatus, ManagerCounters, RetryReport};
pub use queue_manager::{ManagerError, ManagerState, QueueManager};
