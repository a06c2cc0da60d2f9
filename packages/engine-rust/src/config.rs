//! Engine configuration.
//!
//! Every section has a `Default` documenting the stock values and
//! deserializes from camelCase JSON, with durations given in milliseconds
//! (`"ttlMs": 300000`).

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Serde adapter encoding a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Cache eviction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionKind {
    /// Least recently used.
    #[default]
    Lru,
    /// Least frequently used.
    Lfu,
    /// First in, first out.
    Fifo,
}

/// Query cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Default time-to-live for entries stored without an explicit TTL.
    #[serde(rename = "ttlMs", with = "duration_ms")]
    pub ttl: Duration,
    /// Entry count at which inserting a new key evicts one victim.
    pub max_size: usize,
    pub strategy: EvictionKind,
    /// Interval of the background expiry sweep. Zero disables the sweep.
    #[serde(rename = "sweepIntervalMs", with = "duration_ms")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
            max_size: 1000,
            strategy: EvictionKind::Lru,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Retry and backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    #[serde(rename = "baseDelayMs", with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(rename = "maxDelayMs", with = "duration_ms")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// When set, only errors matching one of these (by kind name or message
    /// substring, case-insensitive) are retried.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable_errors: Option<Vec<String>>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            retryable_errors: None,
        }
    }
}

/// Circuit breaker settings. Disabled by default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive failures in `Closed` that trip the breaker.
    pub failure_threshold: u32,
    /// Time after the last failure before `Open` admits a probe.
    #[serde(rename = "resetTimeoutMs", with = "duration_ms")]
    pub reset_timeout: Duration,
    /// Failed probes tolerated in `HalfOpen` before re-opening.
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_max_attempts: 3,
        }
    }
}

/// Map-reduce execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MapReduceOptions {
    /// Process partitions concurrently (bounded by `max_concurrency`).
    pub parallel: bool,
    pub max_concurrency: usize,
    /// Per-partition retry policy. The circuit breaker never applies here.
    pub retry_config: RetryConfig,
    /// Time budget for one attempt at one partition.
    #[serde(rename = "timeoutMs", with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for MapReduceOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            max_concurrency: 10,
            retry_config: RetryConfig::default(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Stream chunking settings (the progress callback is supplied per call).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    pub chunk_size: usize,
    /// Buffered bytes (serialized estimate) that force an early chunk.
    pub max_memory_usage: usize,
    /// Skip unreadable partitions instead of ending the stream with an error.
    pub enable_early_termination: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            max_memory_usage: 50 * 1024 * 1024,
            enable_early_termination: true,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub map_reduce: MapReduceOptions,
    pub stream: StreamConfig,
    /// Partition id used for inserts when neither the caller nor the
    /// manifest settings name one.
    pub default_partition_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            map_reduce: MapReduceOptions::default(),
            stream: StreamConfig::default(),
            default_partition_id: "default".to_string(),
        }
    }
}

impl EngineConfig {
    /// Loads a configuration file; absent keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }
}
