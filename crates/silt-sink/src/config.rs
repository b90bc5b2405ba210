//! Runtime options for the sink.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Sink runtime configuration.
///
/// All fields have production defaults, so an empty document deserializes
/// into a working configuration:
///
/// ```
/// use silt_sink::config::SinkConfig;
///
/// let cfg: SinkConfig = serde_json::from_str("{}").unwrap();
/// assert_eq!(cfg.flush_batch_size, 1000);
/// assert!(!cfg.immediate);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct SinkConfig {
    /// Apply mutations inside the ingress transaction instead of staging
    /// them for resolved-timestamp advancement.
    #[serde(default)]
    pub immediate: bool,

    /// Maximum NDJSON line length in bytes (default: 1 MiB).
    #[serde(default = "default_ndjson_buffer")]
    #[validate(range(min = 4096))]
    pub ndjson_buffer: usize,

    /// Mutations accumulated before handing a batch to the pipeline
    /// (default: 1000). Ingress reads block while a batch is in flight.
    #[serde(default = "default_flush_batch_size")]
    #[validate(range(min = 1, max = 100_000))]
    pub flush_batch_size: usize,

    /// Deadline for staging writes in milliseconds (default: 30s).
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Deadline for apply transactions in milliseconds (default: 60s).
    #[serde(default = "default_apply_timeout_ms")]
    pub apply_timeout_ms: u64,

    /// Deadline for staging drains in milliseconds (default: 60s).
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Retry attempts per resolver round before the loop surfaces an
    /// error and restarts (default: 10).
    #[serde(default = "default_retry_budget")]
    #[validate(range(min = 1, max = 1000))]
    pub retry_budget: u32,

    /// Base retry backoff in milliseconds (default: 100ms).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff cap in milliseconds (default: 30s).
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Depth limit for recursive script dispatch (default: 8).
    #[serde(default = "default_dispatch_depth_limit")]
    #[validate(range(min = 1, max = 64))]
    pub dispatch_depth_limit: usize,

    /// Worker pool size for per-key apply partitions
    /// (default: number of CPUs).
    #[serde(default = "default_apply_workers")]
    #[validate(range(min = 1, max = 256))]
    pub apply_workers: usize,
}

fn default_ndjson_buffer() -> usize {
    1024 * 1024
}

fn default_flush_batch_size() -> usize {
    1000
}

fn default_store_timeout_ms() -> u64 {
    30_000
}

fn default_apply_timeout_ms() -> u64 {
    60_000
}

fn default_drain_timeout_ms() -> u64 {
    60_000
}

fn default_retry_budget() -> u32 {
    10
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_dispatch_depth_limit() -> usize {
    8
}

fn default_apply_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            immediate: false,
            ndjson_buffer: default_ndjson_buffer(),
            flush_batch_size: default_flush_batch_size(),
            store_timeout_ms: default_store_timeout_ms(),
            apply_timeout_ms: default_apply_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            retry_budget: default_retry_budget(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            dispatch_depth_limit: default_dispatch_depth_limit(),
            apply_workers: default_apply_workers(),
        }
    }
}

impl SinkConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}
