//! Queue manager configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_STORE_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_STALE_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Backoff strategy for retry eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `retry_delay` for every attempt
    #[default]
    Fixed,
    /// `retry_delay * attempt`
    Linear,
    /// `retry_delay * 2^(attempt - 1)`
    Exponential,
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!("unknown backoff strategy {other:?}")),
        }
    }
}

/// Configuration for [`QueueManager`](super::QueueManager).
///
/// Defaults: cleanup every 60s, stale after 300s, retry delay 5s (also the
/// retry promotion interval), 3 retries, 30s graceful shutdown, fixed backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueManagerConfig {
    /// Backing store connection target
    pub store_url: String,
    /// Key namespace inside the backing store (`None` = store default)
    pub key_prefix: Option<String>,
    /// How often in-flight entries are scanned for staleness
    pub cleanup_interval: Duration,
    /// Age after which an in-flight entry counts as stalled
    pub stale_request_timeout: Duration,
    /// Base delay before a retried entry becomes eligible again
    pub retry_delay: Duration,
    /// How often the retry queue is scanned for due entries
    pub retry_interval: Duration,
    /// Retries allowed before an entry is permanently failed
    pub max_retries: u32,
    /// Upper bound on how long `stop()` waits for running cycles
    pub graceful_shutdown_timeout: Duration,
    pub retry_backoff: BackoffStrategy,
    /// Cap applied to linear and exponential backoff
    pub max_retry_delay: Duration,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self {
            store_url: DEFAULT_STORE_URL.to_string(),
            key_prefix: None,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            stale_request_timeout: DEFAULT_STALE_REQUEST_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
            retry_interval: DEFAULT_RETRY_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
            graceful_shutdown_timeout: DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT,
            retry_backoff: BackoffStrategy::Fixed,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
        }
    }
}

impl QueueManagerConfig {
    /// Load from process environment, falling back to defaults.
    ///
    /// Reads `QUEUE_STORE_URL` (or `REDIS_URL`), `QUEUE_KEY_PREFIX`,
    /// `QUEUE_CLEANUP_INTERVAL_MS`, `QUEUE_STALE_REQUEST_TIMEOUT_MS`,
    /// `QUEUE_RETRY_DELAY_MS`, `QUEUE_RETRY_INTERVAL_MS`, `QUEUE_MAX_RETRIES`,
    /// `QUEUE_GRACEFUL_SHUTDOWN_TIMEOUT_MS`, `QUEUE_MAX_RETRY_DELAY_MS` and
    /// `QUEUE_RETRY_BACKOFF`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let store_url = get("QUEUE_STORE_URL")
            .or_else(|| get("REDIS_URL"))
            .unwrap_or(defaults.store_url);
        let retry_delay = millis_var(&get, "QUEUE_RETRY_DELAY_MS", defaults.retry_delay)?;

        let config = Self {
            store_url,
            key_prefix: get("QUEUE_KEY_PREFIX"),
            cleanup_interval: millis_var(&get, "QUEUE_CLEANUP_INTERVAL_MS", defaults.cleanup_interval)?,
            stale_request_timeout: millis_var(
                &get,
                "QUEUE_STALE_REQUEST_TIMEOUT_MS",
                defaults.stale_request_timeout,
            )?,
            retry_delay,
            // Unset interval follows the (possibly overridden) delay.
            retry_interval: millis_var(&get, "QUEUE_RETRY_INTERVAL_MS", retry_delay)?,
            max_retries: parsed_var(&get, "QUEUE_MAX_RETRIES", defaults.max_retries)?,
            graceful_shutdown_timeout: millis_var(
                &get,
                "QUEUE_GRACEFUL_SHUTDOWN_TIMEOUT_MS",
                defaults.graceful_shutdown_timeout,
            )?,
            retry_backoff: parsed_var(&get, "QUEUE_RETRY_BACKOFF", defaults.retry_backoff)?,
            max_retry_delay: millis_var(&get, "QUEUE_MAX_RETRY_DELAY_MS", defaults.max_retry_delay)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject zero intervals and timeouts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("cleanup_interval", self.cleanup_interval),
            ("stale_request_timeout", self.stale_request_timeout),
            ("retry_delay", self.retry_delay),
            ("retry_interval", self.retry_interval),
            ("graceful_shutdown_timeout", self.graceful_shutdown_timeout),
            ("max_retry_delay", self.max_retry_delay),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }
        Ok(())
    }

    pub fn with_store_url(mut self, url: impl Into<String>) -> Self {
        self.store_url = url.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_stale_request_timeout(mut self, timeout: Duration) -> Self {
        self.stale_request_timeout = timeout;
        self
    }

    /// Sets the base retry delay. The retry interval is left untouched.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_shutdown_timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, strategy: BackoffStrategy, max_delay: Duration) -> Self {
        self.retry_backoff = strategy;
        self.max_retry_delay = max_delay;
        self
    }

    /// Delay before an entry that has already been retried `retry_count`
    /// times becomes eligible again.
    pub fn retry_delay_for(&self, retry_count: u32) -> Duration {
        let attempt = retry_count.saturating_add(1);
        let delay = match self.retry_backoff {
            BackoffStrategy::Fixed => return self.retry_delay,
            BackoffStrategy::Linear => self.retry_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.retry_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_retry_delay)
    }

    /// Stale timeout in the millisecond unit entry timestamps use.
    pub(crate) fn stale_timeout_ms(&self) -> i64 {
        i64::try_from(self.stale_request_timeout.as_millis()).unwrap_or(i64::MAX)
    }
}

fn millis_var<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| ConfigError::InvalidValue {
                key,
                value: raw,
                reason: e.to_string(),
            }),
    }
}

fn parsed_var<G, T>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}
