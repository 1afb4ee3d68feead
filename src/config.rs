//! Service configuration loaded from environment variables.

use std::fmt::Display;
use std::str::FromStr;

use anyhow::{Context, Result};

/// Runtime configuration. Every knob has a default suitable for local use and
/// can be overridden through a `CRUCIBLE_*` environment variable.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port
    pub port: u16,
    /// Per-request HTTP timeout in seconds; must exceed the largest job
    /// deadline (time limit + grace) you intend to allow
    pub request_timeout_secs: u64,
    /// Bounded job queue capacity
    pub queue_capacity: usize,
    /// Number of worker tasks
    pub worker_count: usize,
    /// Global admission rate in requests per second
    pub global_rps: f64,
    /// Per-client admission rate in requests per second
    pub per_client_rps: f64,
    /// Per-client bucket burst size
    pub per_client_burst: u32,
    /// Maximum concurrently admitted requests
    pub max_concurrent: u32,
    /// Cadence of per-client bucket eviction in seconds
    pub cleanup_interval_secs: u64,
    /// Ceiling on submitted source size in bytes
    pub max_source_bytes: usize,
    /// Default time limit in seconds, applied when the request carries 0
    pub default_time_limit_secs: u64,
    /// Default memory limit in MB, applied when the request carries 0
    pub default_memory_limit_mb: u64,
    /// How long shutdown waits for in-flight jobs before giving up
    pub shutdown_grace_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            port: var_or("CRUCIBLE_PORT", 8080)?,
            request_timeout_secs: var_or("CRUCIBLE_REQUEST_TIMEOUT_SECS", 30)?,
            queue_capacity: var_or("CRUCIBLE_QUEUE_CAPACITY", 100)?,
            worker_count: var_or("CRUCIBLE_WORKERS", 5)?,
            global_rps: var_or("CRUCIBLE_GLOBAL_RPS", 100.0)?,
            per_client_rps: var_or("CRUCIBLE_PER_CLIENT_RPS", 10.0)?,
            per_client_burst: var_or("CRUCIBLE_PER_CLIENT_BURST", 20)?,
            max_concurrent: var_or("CRUCIBLE_MAX_CONCURRENT", 50)?,
            cleanup_interval_secs: var_or("CRUCIBLE_CLEANUP_INTERVAL_SECS", 300)?,
            max_source_bytes: var_or("CRUCIBLE_MAX_SOURCE_BYTES", 64 * 1024)?,
            default_time_limit_secs: var_or("CRUCIBLE_DEFAULT_TIME_LIMIT_SECS", 2)?,
            default_memory_limit_mb: var_or("CRUCIBLE_DEFAULT_MEMORY_LIMIT_MB", 256)?,
            shutdown_grace_secs: var_or("CRUCIBLE_SHUTDOWN_GRACE_SECS", 10)?,
        })
    }
}

fn var_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value for {key}")),
        Err(_) => Ok(default),
    }
}
