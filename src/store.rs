use async_trait::async_trait;

use crate::entry::CacheEntry;
use crate::error::CacheError;

/// A store is a common interface for storing, reading and deleting cache entries.
///
/// Stores must never return an entry past its hard expiry (`entry.stale_until()`);
/// expired entries found on read are evicted and reported as a miss.
#[async_trait]
pub trait Store: Send + Sync {
    /// A name for metrics/tracing.
    ///
    /// # Example
    /// - "memory"
    /// - "durable"
    /// - "tiered"
    fn name(&self) -> &'static str;

    /// Return the cached entry.
    ///
    /// The response must be `None` for cache misses.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Sets the entry for the given key.
    async fn set(&self, namespace: &str, key: &str, entry: CacheEntry) -> Result<(), CacheError>;

    /// Removes the key(s) from the store.
    async fn remove(&self, namespace: &str, keys: &[&str]) -> Result<(), CacheError>;

    /// Every key currently held in `namespace`, without the namespace prefix.
    async fn keys(&self, namespace: &str) -> Result<Vec<String>, CacheError>;

    /// Removes every key in `namespace`.
    async fn clear(&self, namespace: &str) -> Result<(), CacheError> {
        let keys = self.keys(namespace).await?;
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.remove(namespace, &refs).await
    }
}
