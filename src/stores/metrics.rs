//! Metrics middleware for cache tiers.
//!
//! `MetricsStore` wraps any `Store` and emits a [`CacheMetric`] for every
//! read, write and remove to a user-provided sink.
//!
//! # Example
//!
//! ```ignore
//! let memory: Arc<dyn Store> = Arc::new(HashMapStore::new(HashMapStoreConfig::default()));
//! let memory: Arc<dyn Store> = Arc::new(MetricsStore::new(memory, sink.clone()));
//! let client = Client::builder(transport).memory_store(memory).build();
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::store::Store;
use crate::utils::now_ms;

/// Status of a cache entry on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEntryStatus {
    /// Entry is within its ttl.
    Fresh,
    /// Entry is past its ttl but within its max age.
    Stale,
}

/// Metrics emitted by the MetricsStore wrapper.
#[derive(Debug, Clone)]
pub enum CacheMetric {
    Read {
        key: String,
        hit: bool,
        /// Only present when `hit` is true.
        status: Option<CacheEntryStatus>,
        latency_ms: f64,
        tier: String,
        namespace: String,
    },
    Write {
        key: String,
        latency_ms: f64,
        tier: String,
        namespace: String,
    },
    Remove {
        key_count: usize,
        /// First key in the batch, for identification.
        first_key: Option<String>,
        latency_ms: f64,
        tier: String,
        namespace: String,
    },
}

/// Receiver for cache metrics.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Emit a single metric.
    ///
    /// Called synchronously in the hot path of cache operations, so
    /// implementations should only buffer.
    fn emit(&self, metric: CacheMetric);

    /// Flush any buffered metrics.
    async fn flush(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// A store wrapper that emits metrics for all operations.
pub struct MetricsStore {
    inner: Arc<dyn Store>,
    sink: Arc<dyn MetricsSink>,
    tier_name: String,
}

impl MetricsStore {
    pub fn new(inner: Arc<dyn Store>, sink: Arc<dyn MetricsSink>) -> Self {
        let tier_name = inner.name().to_string();
        MetricsStore {
            inner,
            sink,
            tier_name,
        }
    }

    pub fn sink(&self) -> &Arc<dyn MetricsSink> {
        &self.sink
    }

    fn elapsed_ms(start: Instant) -> f64 {
        start.elapsed().as_secs_f64() * 1000.0
    }
}

#[async_trait]
impl Store for MetricsStore {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let start = Instant::now();
        let result = self.inner.get(namespace, key).await;
        let latency_ms = Self::elapsed_ms(start);

        let (hit, status) = match &result {
            Ok(Some(entry)) => {
                let now = now_ms();
                let status = if entry.is_fresh(now) {
                    Some(CacheEntryStatus::Fresh)
                } else if entry.is_stale(now) {
                    Some(CacheEntryStatus::Stale)
                } else {
                    None
                };
                (true, status)
            }
            Ok(None) | Err(_) => (false, None),
        };

        self.sink.emit(CacheMetric::Read {
            key: key.to_string(),
            hit,
            status,
            latency_ms,
            tier: self.tier_name.clone(),
            namespace: namespace.to_string(),
        });

        result
    }

    async fn set(&self, namespace: &str, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let start = Instant::now();
        let result = self.inner.set(namespace, key, entry).await;

        self.sink.emit(CacheMetric::Write {
            key: key.to_string(),
            latency_ms: Self::elapsed_ms(start),
            tier: self.tier_name.clone(),
            namespace: namespace.to_string(),
        });

        result
    }

    async fn remove(&self, namespace: &str, keys: &[&str]) -> Result<(), CacheError> {
        let start = Instant::now();
        let result = self.inner.remove(namespace, keys).await;

        self.sink.emit(CacheMetric::Remove {
            key_count: keys.len(),
            first_key: keys.first().map(|k| k.to_string()),
            latency_ms: Self::elapsed_ms(start),
            tier: self.tier_name.clone(),
            namespace: namespace.to_string(),
        });

        result
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, CacheError> {
        self.inner.keys(namespace).await
    }
}
