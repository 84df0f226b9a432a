//! Builder API for assembling a [`Client`].
//!
//! The builder wires the cache tiers, the resilience layers and the
//! collaborators together from one [`ClientConfig`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::breaker::BreakerRegistry;
use crate::cache::CacheManager;
use crate::cancel::CancellationRegistry;
use crate::client::{Client, ClientInner};
use crate::config::ClientConfig;
use crate::dedupe::Deduplicator;
use crate::offline::{Connectivity, OfflineQueue};
use crate::retry::{RetryCondition, RetryManager};
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::stores::durable::{DurableStore, KeyValueBackend};
use crate::stores::memory::{HashMapStore, HashMapStoreConfig};
use crate::tiered::TieredStore;
use crate::transport::{Interceptor, Transport};

/// Builder for [`Client`] instances.
///
/// # Example
///
/// ```ignore
/// use resilient_fetch::{Client, ClientConfig, MemoryBackend};
/// use std::sync::Arc;
///
/// let client = Client::builder(Arc::new(my_transport))
///     .config(ClientConfig::default())
///     .base_url("https://api.example.com")
///     .durable_backend(Arc::new(MemoryBackend::new()))
///     .build();
/// ```
pub struct ClientBuilder {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    memory: Option<Arc<dyn Store>>,
    durable: Vec<Arc<dyn Store>>,
    interceptor: Option<Arc<dyn Interceptor>>,
    retry_condition: Option<RetryCondition>,
    connectivity: Option<Connectivity>,
}

impl ClientBuilder {
    /// Create a new ClientBuilder around the injected transport.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        ClientBuilder {
            transport,
            config: ClientConfig::default(),
            memory: None,
            durable: Vec::new(),
            interceptor: None,
            retry_condition: None,
            connectivity: None,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = base_url.into();
        self
    }

    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config
            .default_headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Replace the default bounded in-memory tier.
    pub fn memory_store(mut self, store: Arc<dyn Store>) -> Self {
        self.memory = Some(store);
        self
    }

    /// Add a durable tier backed by a key-value collaborator.
    pub fn durable_backend(mut self, backend: Arc<dyn KeyValueBackend>) -> Self {
        self.durable.push(Arc::new(DurableStore::new(backend)));
        self
    }

    /// Add an arbitrary tier after the memory tier, e.g. a
    /// [`MetricsStore`](crate::stores::MetricsStore)-wrapped durable store.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.durable.push(store);
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Replace the status-based retry predicate.
    pub fn retry_condition(mut self, condition: RetryCondition) -> Self {
        self.retry_condition = Some(condition);
        self
    }

    /// Share a connectivity signal with the host application.
    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Build the client.
    ///
    /// When called inside a tokio runtime, a background task replays the
    /// offline queue on every reconnect. Outside a runtime, replay only
    /// happens through [`Client::sync`].
    pub fn build(self) -> Client {
        let config = self.config;

        let memory = self.memory.unwrap_or_else(|| {
            Arc::new(HashMapStore::new(HashMapStoreConfig {
                max_entries: config.cache.memory_max_entries,
            }))
        });
        let mut tiers = vec![memory];
        tiers.extend(self.durable);
        let cache = CacheManager::new(Arc::new(TieredStore::from_stores(tiers)), &config.cache);

        let mut retry = RetryManager::new(config.retry.clone());
        if let Some(condition) = self.retry_condition {
            retry = retry.with_condition(condition);
        }

        let offline = OfflineQueue::new(
            config.offline.clone(),
            self.connectivity.unwrap_or_default(),
        );
        let listener = match tokio::runtime::Handle::try_current() {
            Ok(_) => Some(offline.spawn_listener()),
            Err(_) => {
                tracing::warn!("No tokio runtime at build time, offline replay is manual");
                None
            }
        };

        let dedupe = config
            .dedupe
            .enabled
            .then(|| Deduplicator::new(Duration::from_millis(config.dedupe.max_age_ms)));

        Client::from_inner(ClientInner {
            transport: self.transport,
            interceptor: self.interceptor,
            dedupe,
            scheduler: Scheduler::new(config.max_concurrent, config.max_queue_size),
            breakers: BreakerRegistry::new(config.breaker_scope, config.breaker.clone()),
            retry,
            offline,
            cache,
            cancellation: CancellationRegistry::new(),
            listener,
            config: ClientConfig {
                default_headers: lowercase_keys(&config.default_headers),
                ..config
            },
        })
    }
}

fn lowercase_keys(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect()
}
