//! Key/value response caching with TTL.
//!
//! The cache is deliberately thin: string keys, JSON values, per-write TTLs.
//! Two variants implement the same contract. The local variant is a
//! fixed-capacity LRU map owned by the process; the remote variant is backed
//! by a Redis server shared across replicas. Reads never block longer than
//! one backend round trip; backend read failures degrade to misses while
//! write failures surface to the caller.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CacheError;

pub mod local;
pub mod lock;
pub mod remote;
pub mod response_cache;

pub use local::LocalCache;
pub use lock::DistributedLock;
pub use remote::RemoteCache;
pub use response_cache::ResponseCache;

/// Common contract for both cache variants.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Returns the live value for a key, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    /// Writes one entry, overwriting any previous value.
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError>;

    /// Writes a batch of entries with a shared TTL, atomically at the
    /// backing store's granularity.
    async fn set_many(&self, entries: Vec<(String, Value)>, ttl: Duration)
    -> Result<(), CacheError>;

    /// Removes a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Polls the cache for a key, sleeping `sleep` between attempts, up to
/// `max_retries` additional reads after the first. Used by the foreground
/// path while a warm-up or a coalesced peer request is in flight.
pub async fn poll_for_entry(
    cache: &dyn Cache,
    key: &str,
    max_retries: u32,
    sleep: Duration,
) -> Result<Option<Value>, CacheError> {
    for attempt in 0..=max_retries {
        if let Some(value) = cache.get(key).await? {
            return Ok(Some(value));
        }
        if attempt < max_retries {
            tokio::time::sleep(sleep).await;
        }
    }
    Ok(None)
}

/// Whether a cached value is an error-shaped adapter response.
///
/// The local cache uses this to keep a live success entry in place when a
/// background loop writes an error for the same key.
pub(crate) fn is_error_entry(value: &Value) -> bool {
    value
        .as_object()
        .map(|map| map.contains_key("errorMessage"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_entries_are_recognized_by_shape() {
        assert!(is_error_entry(
            &json!({"statusCode": 502, "errorMessage": "nope"})
        ));
        assert!(!is_error_entry(
            &json!({"statusCode": 200, "data": {}, "result": 1})
        ));
        assert!(!is_error_entry(&json!(true)));
    }
}
