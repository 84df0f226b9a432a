//! Durable (cross-session) cache tier.
//!
//! The durable tier stores each [`CacheEntry`] as a JSON string in a
//! [`KeyValueBackend`]. Backends only need string get/set/delete/list;
//! expiry, tag handling and serialization live in [`DurableStore`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::store::Store;
use crate::utils::{build_cache_key, now_ms, strip_namespace};

/// Key-value persistence used by the durable tier.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value`. `ttl_ms` is a hint for backends that can expire keys themselves.
    async fn set(&self, key: &str, value: String, ttl_ms: Option<i64>) -> Result<(), CacheError>;

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError>;

    /// Every key starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError>;
}

/// Process-local backend. Survives client instances that share it, not process restarts.
#[derive(Default)]
pub struct MemoryBackend {
    state: RwLock<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored value, for inspection.
    pub async fn raw(&self, key: &str) -> Option<String> {
        self.state.read().await.get(key).cloned()
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory-backend"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.state.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String, _ttl_ms: Option<i64>) -> Result<(), CacheError> {
        self.state.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut state = self.state.write().await;
        for key in keys {
            state.remove(key);
        }
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        Ok(self
            .state
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Cache tier that persists JSON-serialized entries through a [`KeyValueBackend`].
pub struct DurableStore {
    backend: Arc<dyn KeyValueBackend>,
}

impl DurableStore {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        DurableStore { backend }
    }
}

#[async_trait]
impl Store for DurableStore {
    fn name(&self) -> &'static str {
        "durable"
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let cache_key = build_cache_key(&namespace, key);

        let Some(json_str) = self.backend.get(&cache_key).await? else {
            return Ok(None);
        };

        let entry: CacheEntry = match serde_json::from_str(&json_str) {
            Ok(entry) => entry,
            Err(e) => {
                // Unreadable entries (older formats, corruption) are dropped rather than surfaced
                tracing::warn!(
                    "Dropping undecodable durable entry: backend={}, key={}, error={}",
                    self.backend.name(),
                    cache_key,
                    e
                );
                self.backend.delete(&[cache_key]).await?;
                return Ok(None);
            }
        };

        if entry.is_expired(now_ms()) {
            self.backend.delete(&[cache_key]).await?;
            return Ok(None);
        }

        Ok(Some(entry))
    }

    async fn set(&self, namespace: &str, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let cache_key = build_cache_key(&namespace, key);
        let json_str = serde_json::to_string(&entry)
            .map_err(|e| CacheError::Serialization(format!("Serialization failed: {}", e)))?;
        let ttl_ms = entry.stale_until() - now_ms();
        self.backend.set(&cache_key, json_str, Some(ttl_ms)).await
    }

    async fn remove(&self, namespace: &str, keys: &[&str]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let cache_keys: Vec<String> = keys
            .iter()
            .map(|k| build_cache_key(&namespace, k))
            .collect();
        self.backend.delete(&cache_keys).await
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, CacheError> {
        let prefix = build_cache_key(&namespace, "");
        let keys = self.backend.keys(&prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|k| strip_namespace(namespace, k))
            .map(str::to_string)
            .collect())
    }
}
