//! Time-expiring sets of desired request parameters.
//!
//! Every subscription-based transport keeps one set per (endpoint,
//! transport) pair. The foreground path adds the parameters of each inbound
//! request with a TTL; the background loop reads all non-expired entries and
//! keeps the cache warm for them. An `add` for parameters already present
//! refreshes their expiry, so actively requested feeds stay subscribed and
//! abandoned ones age out.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use tokio::time::Instant;

use crate::error::CacheError;
use crate::params::RequestParams;
use crate::response::unix_ms_now;

/// Common contract for both subscription set variants.
#[async_trait]
pub trait SubscriptionSet: Send + Sync {
    /// Upserts parameters, refreshing their expiry to `now + ttl`. When two
    /// adds race, the later expiry wins.
    async fn add(
        &self,
        params: &RequestParams,
        ttl: Duration,
        cache_key: &str,
    ) -> Result<(), CacheError>;

    /// Returns every non-expired entry. Enumeration order is unspecified.
    async fn get_all(&self) -> Result<Vec<RequestParams>, CacheError>;

    /// Removes an entry regardless of expiry.
    async fn remove(&self, params: &RequestParams) -> Result<(), CacheError>;
}

struct LocalEntry {
    params: RequestParams,
    expires_at: Instant,
    #[allow(dead_code)]
    cache_key: String,
}

/// In-memory variant. Does not coordinate across replicas.
#[derive(Default)]
pub struct LocalSubscriptionSet {
    entries: Mutex<BTreeMap<String, LocalEntry>>,
}

impl LocalSubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SubscriptionSet for LocalSubscriptionSet {
    async fn add(
        &self,
        params: &RequestParams,
        ttl: Duration,
        cache_key: &str,
    ) -> Result<(), CacheError> {
        let expires_at = Instant::now() + ttl;
        let mut entries = self.entries.lock();
        entries
            .entry(params.canonical())
            .and_modify(|e| e.expires_at = e.expires_at.max(expires_at))
            .or_insert_with(|| LocalEntry {
                params: params.clone(),
                expires_at,
                cache_key: cache_key.to_string(),
            });
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<RequestParams>, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, e| e.expires_at > now);
        Ok(entries.values().map(|e| e.params.clone()).collect())
    }

    async fn remove(&self, params: &RequestParams) -> Result<(), CacheError> {
        self.entries.lock().remove(&params.canonical());
        Ok(())
    }
}

/// Redis sorted-set variant shared across replicas.
///
/// Members are the canonical parameter strings, scores are absolute expiry
/// times in Unix milliseconds. `ZADD GT` keeps the later expiry when adds
/// race; reads trim past-due members with `ZREMRANGEBYSCORE` before
/// enumerating the rest.
pub struct RemoteSubscriptionSet {
    conn: MultiplexedConnection,
    set_key: String,
}

impl RemoteSubscriptionSet {
    pub fn new(conn: MultiplexedConnection, set_key: String) -> Self {
        Self { conn, set_key }
    }

    pub fn set_key(&self) -> &str {
        &self.set_key
    }
}

#[async_trait]
impl SubscriptionSet for RemoteSubscriptionSet {
    async fn add(
        &self,
        params: &RequestParams,
        ttl: Duration,
        _cache_key: &str,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let score = unix_ms_now() + ttl.as_millis() as u64;
        redis::cmd("ZADD")
            .arg(&self.set_key)
            .arg("GT")
            .arg("CH")
            .arg(score)
            .arg(params.canonical())
            .query_async::<()>(&mut conn)
            .await
            .map_err(CacheError::from)
    }

    async fn get_all(&self) -> Result<Vec<RequestParams>, CacheError> {
        let mut conn = self.conn.clone();
        let now = unix_ms_now();

        redis::cmd("ZREMRANGEBYSCORE")
            .arg(&self.set_key)
            .arg("-inf")
            .arg(now)
            .query_async::<()>(&mut conn)
            .await?;

        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.set_key)
            .arg(format!("({now}"))
            .arg("+inf")
            .query_async(&mut conn)
            .await?;

        let mut out = Vec::with_capacity(members.len());
        for member in members {
            match RequestParams::from_canonical(&member) {
                Ok(params) => out.push(params),
                Err(e) => {
                    tracing::warn!(member = %member, error = %e, "unreadable subscription member, dropping");
                    let _: Result<(), _> = redis::cmd("ZREM")
                        .arg(&self.set_key)
                        .arg(&member)
                        .query_async(&mut conn)
                        .await;
                }
            }
        }
        Ok(out)
    }

    async fn remove(&self, params: &RequestParams) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZREM")
            .arg(&self.set_key)
            .arg(params.canonical())
            .query_async::<()>(&mut conn)
            .await
            .map_err(CacheError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(base: &str) -> RequestParams {
        let mut p = RequestParams::new();
        p.insert("base", json!(base));
        p
    }

    #[tokio::test]
    async fn add_and_get_all_returns_live_entries() {
        let set = LocalSubscriptionSet::new();
        set.add(&params("ETH"), Duration::from_secs(60), "k1").await.unwrap();
        set.add(&params("BTC"), Duration::from_secs(60), "k2").await.unwrap();

        let all = set.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_never_surfaced() {
        let set = LocalSubscriptionSet::new();
        set.add(&params("ETH"), Duration::from_millis(50), "k").await.unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(set.get_all().await.unwrap().is_empty());
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn zero_ttl_entries_are_never_surfaced() {
        let set = LocalSubscriptionSet::new();
        set.add(&params("ETH"), Duration::ZERO, "k").await.unwrap();
        assert!(set.get_all().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn add_refreshes_expiry() {
        let set = LocalSubscriptionSet::new();
        set.add(&params("ETH"), Duration::from_millis(100), "k").await.unwrap();
        tokio::time::advance(Duration::from_millis(80)).await;
        set.add(&params("ETH"), Duration::from_millis(100), "k").await.unwrap();
        tokio::time::advance(Duration::from_millis(80)).await;

        // Still alive thanks to the refresh, and only one entry exists.
        let all = set.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn racing_adds_keep_the_later_expiry() {
        let set = LocalSubscriptionSet::new();
        set.add(&params("ETH"), Duration::from_millis(500), "k").await.unwrap();
        // A shorter refresh must not shorten the existing expiry.
        set.add(&params("ETH"), Duration::from_millis(50), "k").await.unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(set.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_deletes_entry() {
        let set = LocalSubscriptionSet::new();
        set.add(&params("ETH"), Duration::from_secs(60), "k").await.unwrap();
        set.remove(&params("ETH")).await.unwrap();
        assert!(set.get_all().await.unwrap().is_empty());
    }
}
