//! Queue daemon: runs a queue manager until ctrl-c.
//!
//! Store selection follows `USE_PERSISTENT_STORES`: `true` uses Redis at
//! `QUEUE_STORE_URL`/`REDIS_URL` (requires the `redis` feature), anything else
//! the in-memory store.

use std::time::Duration;

use anyhow::Context;
use dispatchq_infra::{InMemoryQueueStore, QueueManager, QueueManagerConfig, QueueStore};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dispatchq_observability::init();

    let config = QueueManagerConfig::from_env().context("invalid queue configuration")?;

    let use_persistent = std::env::var("USE_PERSISTENT_STORES")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    if use_persistent {
        #[cfg(feature = "redis")]
        {
            let store = dispatchq_infra::queue_store::RedisQueueStore::new(
                &config.store_url,
                config.key_prefix.clone(),
            )
            .context("invalid queue store url")?;
            return run(store, config).await;
        }
        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!("USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory");
        }
    }

    run(InMemoryQueueStore::new(), config).await
}

async fn run<S: QueueStore + 'static>(store: S, config: QueueManagerConfig) -> anyhow::Result<()> {
    let manager = QueueManager::new(store, config).context("failed to build queue manager")?;
    manager.start().await.context("failed to start queue manager")?;

    let mut health_tick = tokio::time::interval(HEALTH_LOG_INTERVAL);
    health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::error!(error = %e, "failed to listen for shutdown signal");
                }
                tracing::info!("shutdown signal received");
                break;
            }
            _ = health_tick.tick() => {
                let health = manager.health_status().await;
                let report = serde_json::to_value(&health).unwrap_or_default();
                if health.is_healthy {
                    tracing::info!(health = %report, "queue health");
                } else {
                    tracing::warn!(health = %report, "queue degraded");
                }
            }
        }
    }

    manager.stop().await.context("failed to stop queue manager")?;
    Ok(())
}
