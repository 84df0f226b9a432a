use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::request::ResponseEnvelope;

/// A cached response with its expiration times and tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The cached response.
    pub data: ResponseEnvelope,

    /// Unix timestamp in milliseconds when the entry was written.
    pub stored_at_ms: i64,

    /// Soft expiry. Past this the entry is stale but some strategies still serve it.
    pub ttl_ms: i64,

    /// Hard expiry. Past this the entry must not be served and is evicted on read.
    pub max_age_ms: i64,

    /// Tags used for bulk invalidation.
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl CacheEntry {
    /// Create a new cache entry.
    pub fn new(data: ResponseEnvelope, stored_at_ms: i64, ttl_ms: i64, max_age_ms: i64) -> Self {
        CacheEntry {
            data,
            stored_at_ms,
            ttl_ms,
            max_age_ms,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Unix timestamp in milliseconds until which the entry is fresh.
    pub fn fresh_until(&self) -> i64 {
        self.stored_at_ms.saturating_add(self.ttl_ms)
    }

    /// Unix timestamp in milliseconds after which the entry is no longer valid.
    pub fn stale_until(&self) -> i64 {
        self.stored_at_ms.saturating_add(self.max_age_ms)
    }

    /// Check if the entry is still fresh (not yet stale).
    pub fn is_fresh(&self, now_ms: i64) -> bool {
        now_ms < self.fresh_until() && !self.is_expired(now_ms)
    }

    /// Check if the entry is stale but still usable.
    pub fn is_stale(&self, now_ms: i64) -> bool {
        now_ms >= self.fresh_until() && now_ms < self.stale_until()
    }

    /// Check if the entry has expired and should not be used.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.stale_until()
    }

    /// Whether any of `tags` is carried by this entry.
    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|t| self.tags.contains(t))
    }
}
