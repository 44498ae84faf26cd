//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in secrecy::SecretString to
//! prevent log leaks.

pub mod secrets;

use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub max_connections: u32,
    pub queue: QueueConfig,
}

/// Tuning for workers, leases, and the watchdog.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of independent worker loops.
    pub worker_count: usize,
    /// Sleep between claims when the queue is empty.
    pub poll_interval: Duration,
    /// Sleep after a store failure inside a worker loop.
    pub error_backoff: Duration,
    /// How long a claimed task may run before the watchdog fails it.
    pub lease: Duration,
    /// Period of the watchdog sweep.
    pub watchdog_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            lease: Duration::from_secs(15 * 60),
            watchdog_interval: Duration::from_secs(60),
            retry: RetryPolicy::Never,
        }
    }
}

impl QueueConfig {
    /// Smallest pool that never starves the watchdog or an in-process
    /// producer: one connection per worker plus two.
    pub fn min_connections(&self) -> u32 {
        self.worker_count as u32 + 2
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        let defaults = QueueConfig::default();
        let queue = QueueConfig {
            worker_count: parsed_var("QUEUE_WORKER_COUNT")?.unwrap_or(defaults.worker_count),
            poll_interval: parsed_var("QUEUE_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            error_backoff: parsed_var("QUEUE_ERROR_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.error_backoff),
            lease: parsed_var("QUEUE_LEASE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease),
            watchdog_interval: parsed_var("QUEUE_WATCHDOG_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.watchdog_interval),
            retry: parsed_var("QUEUE_MAX_ATTEMPTS")?
                .map(RetryPolicy::from_max_attempts)
                .unwrap_or(defaults.retry),
        };

        if queue.worker_count == 0 {
            return Err(Error::Config("QUEUE_WORKER_COUNT must be at least 1".to_string()));
        }

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            max_connections: parsed_var("QUEUE_MAX_CONNECTIONS")?
                .unwrap_or_else(|| queue.min_connections()),
            queue,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
