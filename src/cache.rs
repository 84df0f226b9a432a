use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use crate::config::{CacheConfig, CacheOptions, CacheStrategy};
use crate::entry::CacheEntry;
use crate::error::{CacheError, RequestError};
use crate::request::ResponseEnvelope;
use crate::store::Store;
use crate::tiered::TieredStore;
use crate::utils::{build_cache_key, now_ms};

/// Strategy-driven cache in front of the network.
///
/// Reads go through the [`TieredStore`] (memory first, durable second, with
/// promotion). Only successful network results are written. Read errors
/// degrade to a miss, except under `cache-only` where they surface as
/// [`RequestError::Cache`]. Write errors are logged.
#[derive(Clone)]
pub struct CacheManager {
    store: Arc<TieredStore>,
    namespace: String,
    default_ttl_ms: i64,
    default_max_age_ms: i64,
    /// To prevent concurrent revalidation of the same key, background refreshes are deduplicated.
    revalidating: Arc<Mutex<HashSet<String>>>,
}

impl CacheManager {
    pub fn new(store: Arc<TieredStore>, config: &CacheConfig) -> Self {
        CacheManager {
            store,
            namespace: config.namespace.clone(),
            default_ttl_ms: config.default_ttl_ms,
            default_max_age_ms: config.default_max_age_ms,
            revalidating: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Return the cached entry for `key`, if one exists within its max age.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        match self.store.get(&self.namespace, key).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Cache read failed, treating as miss: key={}, error={}", key, e);
                None
            }
        }
    }

    /// Store a response under `key` with the given options.
    pub async fn set(
        &self,
        key: &str,
        response: &ResponseEnvelope,
        options: &CacheOptions,
    ) -> Result<(), CacheError> {
        let entry = self.build_entry(response, options);
        self.store.set(&self.namespace, key, entry).await
    }

    /// Removes the key from every tier.
    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.store.remove(&self.namespace, &[key]).await
    }

    /// Remove every entry carrying any of `tags`. Returns the removed keys.
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> Result<Vec<String>, CacheError> {
        self.store.invalidate_by_tags(&self.namespace, tags).await
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        self.store.clear(&self.namespace).await
    }

    fn build_entry(&self, response: &ResponseEnvelope, options: &CacheOptions) -> CacheEntry {
        let mut data = response.clone();
        data.served_from_cache = false;
        CacheEntry::new(
            data,
            now_ms(),
            options.ttl_ms.unwrap_or(self.default_ttl_ms),
            options.max_age_ms.unwrap_or(self.default_max_age_ms),
        )
        .with_tags(options.tags.iter().cloned())
    }

    async fn store_quietly(&self, key: &str, response: &ResponseEnvelope, options: &CacheOptions) {
        if let Err(e) = self.set(key, response, options).await {
            tracing::warn!("Cache write failed: key={}, error={}", key, e);
        }
    }

    async fn fetch_and_store<Fut>(
        &self,
        key: &str,
        options: &CacheOptions,
        fetch: Fut,
    ) -> Result<ResponseEnvelope, RequestError>
    where
        Fut: Future<Output = Result<ResponseEnvelope, RequestError>>,
    {
        let response = fetch.await?;
        self.store_quietly(key, &response, options).await;
        Ok(response)
    }

    /// Resolve a request through the cache according to `options.strategy`.
    ///
    /// `fetch` performs the network call. It is invoked at most once, possibly
    /// on a background task (stale-while-revalidate).
    pub async fn fetch<F, Fut>(
        &self,
        key: &str,
        options: &CacheOptions,
        fetch: F,
    ) -> Result<ResponseEnvelope, RequestError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<ResponseEnvelope, RequestError>> + Send + 'static,
    {
        match options.strategy {
            CacheStrategy::CacheFirst => {
                if let Some(entry) = self.get(key).await {
                    return Ok(entry.data.from_cache());
                }
                self.fetch_and_store(key, options, fetch()).await
            }
            CacheStrategy::NetworkFirst => match fetch().await {
                Ok(response) => {
                    self.store_quietly(key, &response, options).await;
                    Ok(response)
                }
                Err(e) if e.is_cancellation() => Err(e),
                Err(e) => match self.get(key).await {
                    Some(entry) => {
                        tracing::debug!(
                            "Network failed, serving cached response: key={}, error={}",
                            key,
                            e
                        );
                        Ok(entry.data.from_cache())
                    }
                    None => Err(e),
                },
            },
            CacheStrategy::StaleWhileRevalidate => {
                if let Some(entry) = self.get(key).await {
                    self.spawn_revalidation(key, options, fetch);
                    return Ok(entry.data.from_cache());
                }
                self.fetch_and_store(key, options, fetch()).await
            }
            // Nothing to fall back on, so a tier failure is reported as such
            CacheStrategy::CacheOnly => match self.store.get(&self.namespace, key).await? {
                Some(entry) => Ok(entry.data.from_cache()),
                None => Err(RequestError::CacheMiss {
                    key: key.to_string(),
                }),
            },
            CacheStrategy::NetworkOnly => self.fetch_and_store(key, options, fetch()).await,
        }
    }

    /// Spawn a background refresh. Failures are logged and never reach the caller.
    fn spawn_revalidation<F, Fut>(&self, key: &str, options: &CacheOptions, fetch: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<ResponseEnvelope, RequestError>> + Send + 'static,
    {
        let revalidate_key = build_cache_key(&self.namespace, key);

        // Check if already revalidating, and mark if not
        if !self.revalidating.lock().insert(revalidate_key.clone()) {
            return;
        }

        let manager = self.clone();
        let key = key.to_string();
        let options = options.clone();

        tokio::spawn(async move {
            match fetch().await {
                Ok(response) => manager.store_quietly(&key, &response, &options).await,
                Err(e) => {
                    tracing::debug!("Background revalidation failed: key={}, error={}", key, e);
                }
            }

            manager.revalidating.lock().remove(&revalidate_key);
        });
    }
}
