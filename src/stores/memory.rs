use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::store::Store;
use crate::utils::{build_cache_key, now_ms, strip_namespace};

/// Configuration for HashMapStore.
#[derive(Debug, Clone)]
pub struct HashMapStoreConfig {
    /// Maximum number of entries across all namespaces.
    ///
    /// When a new key would exceed the bound, expired entries are dropped
    /// first, then the entry with the oldest `stored_at_ms`.
    pub max_entries: usize,
}

impl Default for HashMapStoreConfig {
    fn default() -> Self {
        HashMapStoreConfig { max_entries: 100 }
    }
}

/// Bounded in-memory cache tier using HashMap with RwLock.
pub struct HashMapStore {
    state: RwLock<HashMap<String, CacheEntry>>,
    max_entries: usize,
}

impl HashMapStore {
    /// Create a new HashMapStore with the given configuration.
    pub fn new(config: HashMapStoreConfig) -> Self {
        HashMapStore {
            state: RwLock::new(HashMap::new()),
            max_entries: config.max_entries.max(1),
        }
    }

    /// Number of entries currently held, expired or not.
    pub async fn len(&self) -> usize {
        self.state.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.is_empty()
    }

    /// Make room for one more entry.
    fn evict_for_insert(state: &mut HashMap<String, CacheEntry>, max_entries: usize) {
        if state.len() < max_entries {
            return;
        }

        let now = now_ms();
        state.retain(|_, v| !v.is_expired(now));

        while state.len() >= max_entries {
            let oldest = state
                .iter()
                .min_by_key(|(_, v)| v.stored_at_ms)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    tracing::debug!("Evicting oldest memory entry: key={}", key);
                    state.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl Store for HashMapStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let cache_key = build_cache_key(&namespace, key);
        let state = self.state.read().await;

        let Some(stored) = state.get(&cache_key) else {
            return Ok(None);
        };

        if stored.is_expired(now_ms()) {
            // Entry is expired, remove it
            drop(state);
            let mut state = self.state.write().await;
            state.remove(&cache_key);
            return Ok(None);
        }

        Ok(Some(stored.clone()))
    }

    async fn set(&self, namespace: &str, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let cache_key = build_cache_key(&namespace, key);
        let mut state = self.state.write().await;

        if !state.contains_key(&cache_key) {
            Self::evict_for_insert(&mut state, self.max_entries);
        }
        state.insert(cache_key, entry);
        Ok(())
    }

    async fn remove(&self, namespace: &str, keys: &[&str]) -> Result<(), CacheError> {
        let mut state = self.state.write().await;

        for key in keys {
            let cache_key = build_cache_key(&namespace, key);
            state.remove(&cache_key);
        }

        Ok(())
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, CacheError> {
        let state = self.state.read().await;
        Ok(state
            .keys()
            .filter_map(|k| strip_namespace(namespace, k))
            .map(str::to_string)
            .collect())
    }

    async fn clear(&self, namespace: &str) -> Result<(), CacheError> {
        let mut state = self.state.write().await;
        state.retain(|k, _| strip_namespace(namespace, k).is_none());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ResponseBody, ResponseEnvelope};

    fn entry_at(stored_at_ms: i64, text: &str) -> CacheEntry {
        let data = ResponseEnvelope::new(200, "OK", ResponseBody::Text(text.into()));
        CacheEntry::new(data, stored_at_ms, 60_000, 300_000)
    }

    #[tokio::test]
    async fn test_get_set_remove() {
        let store = HashMapStore::new(HashMapStoreConfig::default());

        // Initially empty
        let result = store.get("http", "key1").await.unwrap();
        assert!(result.is_none());

        store.set("http", "key1", entry_at(now_ms(), "value1")).await.unwrap();

        let result = store.get("http", "key1").await.unwrap();
        assert_eq!(
            result.unwrap().data.data,
            ResponseBody::Text("value1".into())
        );

        store.remove("http", &["key1"]).await.unwrap();

        let result = store.get("http", "key1").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_evicted_on_read() {
        let store = HashMapStore::new(HashMapStoreConfig::default());
        let now = now_ms();
        store
            .set("http", "old", entry_at(now - 400_000, "gone"))
            .await
            .unwrap();

        assert!(store.get("http", "old").await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_evicts_oldest_when_full() {
        let store = HashMapStore::new(HashMapStoreConfig { max_entries: 2 });
        let now = now_ms();

        store.set("http", "b", entry_at(now - 10, "b")).await.unwrap();
        store.set("http", "a", entry_at(now - 20, "a")).await.unwrap();
        store.set("http", "c", entry_at(now, "c")).await.unwrap();

        assert_eq!(store.len().await, 2);
        assert!(store.get("http", "a").await.unwrap().is_none());
        assert!(store.get("http", "b").await.unwrap().is_some());
        assert!(store.get("http", "c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let store = HashMapStore::new(HashMapStoreConfig { max_entries: 2 });
        let now = now_ms();

        store.set("http", "a", entry_at(now - 20, "a")).await.unwrap();
        store.set("http", "b", entry_at(now - 10, "b")).await.unwrap();
        store.set("http", "a", entry_at(now, "a2")).await.unwrap();

        assert_eq!(store.len().await, 2);
        assert!(store.get("http", "b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_keys_and_clear_are_namespaced() {
        let store = HashMapStore::new(HashMapStoreConfig::default());
        let now = now_ms();
        store.set("http", "a", entry_at(now, "a")).await.unwrap();
        store.set("other", "b", entry_at(now, "b")).await.unwrap();

        assert_eq!(store.keys("http").await.unwrap(), vec!["a".to_string()]);

        store.clear("http").await.unwrap();
        assert!(store.get("http", "a").await.unwrap().is_none());
        assert!(store.get("other", "b").await.unwrap().is_some());
    }
}
