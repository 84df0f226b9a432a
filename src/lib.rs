//! resilient-fetch - a client-side request orchestration core for Rust
//!
//! This library turns an unreliable injected transport into a dependable one:
//! - Deduplication of identical concurrent requests
//! - Priority admission under a concurrency bound
//! - Circuit breaking, global or per endpoint
//! - Retries with exponential, linear or fixed backoff and `Retry-After`
//! - An offline queue replayed on reconnect
//! - A two-tier cache (memory + durable) with five strategies and tag invalidation
//!
//! # Example
//!
//! ```ignore
//! use resilient_fetch::{
//!     CacheOptions, CacheStrategy, Client, FnTransport, Priority, RawResponse, RequestDescriptor,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = Arc::new(FnTransport(|req, _cancel| async move {
//!         // Hand `req` to a real HTTP stack here
//!         Ok(RawResponse::new(200, format!("fetched {}", req.url)))
//!     }));
//!
//!     let client = Client::builder(transport)
//!         .base_url("https://api.example.com")
//!         .build();
//!
//!     let notes = client
//!         .execute(
//!             RequestDescriptor::get("/notes")
//!                 .priority(Priority::High)
//!                 .cache(CacheOptions::new(CacheStrategy::StaleWhileRevalidate).tag("notes")),
//!         )
//!         .await
//!         .unwrap();
//!
//!     // Writes drop every cached read tagged "notes"
//!     client.invalidate_by_tags(&["notes".to_string()]).await.unwrap();
//! }
//! ```

pub mod breaker;
mod builder;
pub mod cache;
pub mod cancel;
mod client;
pub mod config;
pub mod dedupe;
mod entry;
mod error;
pub mod offline;
mod request;
pub mod retry;
pub mod scheduler;
mod store;
pub mod stores;
mod tiered;
pub mod transport;
mod utils;

// Re-export public API
pub use breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerState, CircuitState};
pub use builder::ClientBuilder;
pub use cache::CacheManager;
pub use cancel::{CancelReason, CancellationRegistry, DeadlineToken, RequestToken};
pub use client::Client;
pub use config::{
    Backoff, BreakerScope, CacheConfig, CacheOptions, CacheStrategy, CircuitBreakerConfig,
    ClientConfig, DedupeConfig, OfflineConfig, RetryConfig, RetryOverrides,
};
pub use dedupe::Deduplicator;
pub use entry::CacheEntry;
pub use error::{CacheError, ErrorInfo, RequestError};
pub use offline::{Connectivity, OfflineQueue, ReplayFn};
pub use request::{ContentKind, Method, Priority, RequestDescriptor, ResponseBody, ResponseEnvelope};
pub use retry::{RetryCondition, RetryManager, parse_retry_after};
pub use scheduler::{Scheduler, SchedulerPermit, SchedulerStats};
pub use store::Store;
pub use stores::{
    CacheEntryStatus, CacheMetric, DurableStore, HashMapStore, HashMapStoreConfig,
    KeyValueBackend, MemoryBackend, MetricsSink, MetricsStore, RedisBackend, RedisBackendConfig,
};
pub use tiered::TieredStore;
pub use transport::{FnTransport, Interceptor, RawResponse, Transport, TransportRequest};
