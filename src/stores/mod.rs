//! Cache tier implementations.

pub mod durable;
pub mod memory;
pub mod metrics;
pub mod redis;

pub use durable::{DurableStore, KeyValueBackend, MemoryBackend};
pub use memory::{HashMapStore, HashMapStoreConfig};
pub use metrics::{CacheEntryStatus, CacheMetric, MetricsSink, MetricsStore};
pub use redis::{RedisBackend, RedisBackendConfig};
