use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::store::Store;

/// TieredStore checks multiple stores in order.
///
/// The first store to return a value is used to populate all previous stores,
/// so a durable hit is promoted into memory before it is returned.
pub struct TieredStore {
    tiers: Vec<Arc<dyn Store>>,
}

impl TieredStore {
    /// Tiers are checked in the order given, fastest first.
    pub fn from_stores(stores: Vec<Arc<dyn Store>>) -> Self {
        TieredStore { tiers: stores }
    }

    /// Remove every entry, in every tier, whose tag set intersects `tags`.
    ///
    /// Returns the distinct keys removed.
    pub async fn invalidate_by_tags(
        &self,
        namespace: &str,
        tags: &[String],
    ) -> Result<Vec<String>, CacheError> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }

        let mut removed = BTreeSet::new();
        for tier in &self.tiers {
            let mut matching = Vec::new();
            for key in tier.keys(namespace).await? {
                // Expired entries come back as None and are evicted by the read itself
                if let Some(entry) = tier.get(namespace, &key).await?
                    && entry.has_any_tag(tags)
                {
                    matching.push(key);
                }
            }

            if !matching.is_empty() {
                let refs: Vec<&str> = matching.iter().map(String::as_str).collect();
                tier.remove(namespace, &refs).await?;
                tracing::debug!(
                    "Invalidated tagged entries: tier={}, namespace={}, count={}",
                    tier.name(),
                    namespace,
                    matching.len()
                );
            }
            removed.extend(matching);
        }

        Ok(removed.into_iter().collect())
    }
}

#[async_trait]
impl Store for TieredStore {
    fn name(&self) -> &'static str {
        "tiered"
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        for (i, tier) in self.tiers.iter().enumerate() {
            let Some(entry) = tier.get(namespace, key).await? else {
                continue;
            };

            // Promote into every faster tier before returning
            for lower in &self.tiers[..i] {
                match lower.set(namespace, key, entry.clone()).await {
                    Ok(_) => {
                        tracing::debug!(
                            "Promoted entry into faster tier: tier={}, namespace={}, key={}",
                            lower.name(),
                            namespace,
                            key
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Failed to promote entry: tier={}, namespace={}, key={}, error={}",
                            lower.name(),
                            namespace,
                            key,
                            e
                        );
                    }
                }
            }

            return Ok(Some(entry));
        }

        Ok(None)
    }

    async fn set(&self, namespace: &str, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        // Set on all tiers in parallel
        let futures: Vec<_> = self
            .tiers
            .iter()
            .map(|tier| tier.set(namespace, key, entry.clone()))
            .collect();

        // Return first error if any
        for result in join_all(futures).await {
            result?;
        }

        Ok(())
    }

    async fn remove(&self, namespace: &str, keys: &[&str]) -> Result<(), CacheError> {
        let futures: Vec<_> = self
            .tiers
            .iter()
            .map(|tier| tier.remove(namespace, keys))
            .collect();

        for result in join_all(futures).await {
            result?;
        }

        Ok(())
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, CacheError> {
        let mut keys = BTreeSet::new();
        for tier in &self.tiers {
            keys.extend(tier.keys(namespace).await?);
        }
        Ok(keys.into_iter().collect())
    }

    async fn clear(&self, namespace: &str) -> Result<(), CacheError> {
        let futures: Vec<_> = self.tiers.iter().map(|tier| tier.clear(namespace)).collect();

        for result in join_all(futures).await {
            result?;
        }

        Ok(())
    }
}
