//! Shared utilities for the client.

use std::collections::hash_map::DefaultHasher;
use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

/// Build a composite cache key from namespace and key.
///
/// Format: `{namespace}::{key}`
pub fn build_cache_key<N: Display>(namespace: &N, key: &str) -> String {
    format!("{}::{}", namespace, key)
}

/// Strip the `{namespace}::` prefix from a composite key.
pub fn strip_namespace<'a>(namespace: &str, cache_key: &'a str) -> Option<&'a str> {
    cache_key
        .strip_prefix(namespace)
        .and_then(|rest| rest.strip_prefix("::"))
}

/// Get the current time in milliseconds since UNIX epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// 64-bit content hash rendered as hex. Stable within a process.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
