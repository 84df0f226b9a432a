//! Client-level defaults and per-request overrides.
//!
//! Every struct here implements `Default` with the documented defaults and
//! deserializes with `#[serde(default)]`, so a host can load a partial JSON or
//! TOML document and get the rest filled in.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Prefix joined onto every request target.
    pub base_url: String,
    /// Headers sent with every request unless the request overrides them.
    pub default_headers: BTreeMap<String, String>,
    /// Maximum number of requests in flight at once.
    pub max_concurrent: usize,
    /// Maximum number of requests waiting for a slot.
    pub max_queue_size: usize,
    pub dedupe: DedupeConfig,
    pub breaker: CircuitBreakerConfig,
    pub breaker_scope: BreakerScope,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub offline: OfflineConfig,
    /// Default per-request deadline. `None` disables the deadline.
    pub timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            base_url: String::new(),
            default_headers: BTreeMap::new(),
            max_concurrent: 6,
            max_queue_size: 100,
            dedupe: DedupeConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            breaker_scope: BreakerScope::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            offline: OfflineConfig::default(),
            timeout_ms: Some(30_000),
        }
    }
}

/// Configuration for collapsing identical concurrent requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeConfig {
    pub enabled: bool,
    /// An in-flight registration older than this is ignored and replaced.
    pub max_age_ms: u64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        DedupeConfig {
            enabled: true,
            max_age_ms: 5_000,
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is let through.
    pub reset_timeout_ms: u64,
    /// Consecutive half-open successes that close the circuit.
    pub successes_required_to_close: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            successes_required_to_close: 2,
        }
    }
}

/// Whether one breaker guards the whole client or one breaker per endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerScope {
    #[default]
    Global,
    PerEndpoint,
}

/// Backoff curve between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backoff {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

/// Retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// HTTP statuses that are retried by the default predicate.
    pub retryable_errors: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            backoff: Backoff::Exponential,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            retryable_errors: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

/// Per-request retry overrides. Unset fields fall back to the client's [`RetryConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOverrides {
    pub max_attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub retryable_errors: Option<Vec<u16>>,
}

impl RetryOverrides {
    /// Merge onto client defaults.
    pub fn apply(&self, base: &RetryConfig) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            backoff: self.backoff.unwrap_or(base.backoff),
            initial_delay_ms: self.initial_delay_ms.unwrap_or(base.initial_delay_ms),
            max_delay_ms: self.max_delay_ms.unwrap_or(base.max_delay_ms),
            retryable_errors: self
                .retryable_errors
                .clone()
                .unwrap_or_else(|| base.retryable_errors.clone()),
        }
    }
}

/// How a request interacts with the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    #[default]
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
    CacheOnly,
    NetworkOnly,
}

/// Client-level cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Namespace prefix for every key this client writes.
    pub namespace: String,
    /// Capacity of the in-memory tier.
    pub memory_max_entries: usize,
    /// Soft expiry applied when a request does not set one.
    pub default_ttl_ms: i64,
    /// Hard expiry applied when a request does not set one.
    pub default_max_age_ms: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            namespace: "http".to_string(),
            memory_max_entries: 100,
            default_ttl_ms: 300_000,
            default_max_age_ms: 3_600_000,
        }
    }
}

/// Per-request cache options. Presence on a request opts it into caching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    pub strategy: CacheStrategy,
    pub ttl_ms: Option<i64>,
    pub max_age_ms: Option<i64>,
    pub tags: Vec<String>,
    /// Explicit cache key; derived from method, target and params when unset.
    pub key: Option<String>,
}

impl CacheOptions {
    pub fn new(strategy: CacheStrategy) -> Self {
        CacheOptions {
            strategy,
            ..Default::default()
        }
    }

    pub fn ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn max_age_ms(mut self, max_age_ms: i64) -> Self {
        self.max_age_ms = Some(max_age_ms);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Offline queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    pub queue_size: usize,
    /// Replays allowed per parked request before its caller is rejected.
    pub max_replay_attempts: u32,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        OfflineConfig {
            queue_size: 100,
            max_replay_attempts: 3,
        }
    }
}
