//! In-process cache variant: fixed capacity, LRU eviction, lazy expiry.
//!
//! Entries live in a slab of doubly-linked nodes so both promotion on read
//! and eviction on insert are O(1). There is no background sweeper; expired
//! entries are dropped when read, or displaced by LRU pressure.
//!
//! Write policy: a live success entry is never overwritten by an error write
//! for the same key. The error write is dropped until the success entry
//! expires on its own.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use crate::cache::{Cache, is_error_entry};
use crate::error::CacheError;

const NIL: usize = usize::MAX;

struct Node {
    key: String,
    value: Value,
    expires_at: Instant,
    prev: usize,
    next: usize,
}

struct LruInner {
    map: HashMap<String, usize>,
    nodes: Vec<Node>,
    free: Vec<usize>,
    /// Most recently used.
    head: usize,
    /// Least recently used.
    tail: usize,
}

impl LruInner {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn promote(&mut self, idx: usize) {
        if self.head != idx {
            self.detach(idx);
            self.push_front(idx);
        }
    }

    fn remove(&mut self, idx: usize) {
        self.detach(idx);
        let key = std::mem::take(&mut self.nodes[idx].key);
        self.nodes[idx].value = Value::Null;
        self.map.remove(&key);
        self.free.push(idx);
    }

    fn allocate(&mut self, key: String, value: Value, expires_at: Instant) -> usize {
        if let Some(idx) = self.free.pop() {
            let node = &mut self.nodes[idx];
            node.key = key;
            node.value = value;
            node.expires_at = expires_at;
            node.prev = NIL;
            node.next = NIL;
            idx
        } else {
            self.nodes.push(Node {
                key,
                value,
                expires_at,
                prev: NIL,
                next: NIL,
            });
            self.nodes.len() - 1
        }
    }
}

/// Fixed-capacity local cache.
pub struct LocalCache {
    inner: Mutex<LruInner>,
    capacity: usize,
}

impl LocalCache {
    /// Creates a cache holding at most `capacity` entries. A zero capacity
    /// is rounded up to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(LruInner::new(capacity)),
            capacity,
        }
    }

    /// Current number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_sync(&self, key: &str, value: Value, ttl: Duration) {
        let now = Instant::now();
        let expires_at = now + ttl;
        let mut inner = self.inner.lock();

        if let Some(&idx) = inner.map.get(key) {
            let existing_live = inner.nodes[idx].expires_at > now;
            if existing_live && !is_error_entry(&inner.nodes[idx].value) && is_error_entry(&value) {
                // Success entries dominate concurrent error writes within TTL.
                return;
            }
            inner.nodes[idx].value = value;
            inner.nodes[idx].expires_at = expires_at;
            inner.promote(idx);
            return;
        }

        if inner.map.len() >= self.capacity {
            let lru = inner.tail;
            if lru != NIL {
                inner.remove(lru);
            }
        }

        let idx = inner.allocate(key.to_string(), value, expires_at);
        inner.map.insert(key.to_string(), idx);
        inner.push_front(idx);
    }
}

#[async_trait]
impl Cache for LocalCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.map.get(key) else {
            return Ok(None);
        };
        if inner.nodes[idx].expires_at <= now {
            inner.remove(idx);
            return Ok(None);
        }
        inner.promote(idx);
        Ok(Some(inner.nodes[idx].value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        self.set_sync(key, value, ttl);
        Ok(())
    }

    async fn set_many(
        &self,
        entries: Vec<(String, Value)>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        for (key, value) in entries {
            self.set_sync(&key, value, ttl);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        if let Some(&idx) = inner.map.get(key) {
            inner.remove(idx);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn set_get_roundtrip() {
        let cache = LocalCache::new(10);
        cache.set("a", json!({"v": 1}), TTL).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap(), Some(json!({"v": 1})));
        assert_eq!(cache.get("missing").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_read_as_miss_and_are_dropped() {
        let cache = LocalCache::new(10);
        cache.set("a", json!(1), Duration::from_millis(50)).await.unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(cache.get("a").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn capacity_overflow_evicts_least_recently_used() {
        let cache = LocalCache::new(4);
        for key in ["a", "b", "c", "d"] {
            cache.set(key, json!(key), TTL).await.unwrap();
        }
        // Touch "a" so "b" becomes the LRU entry.
        cache.get("a").await.unwrap();
        cache.set("e", json!("e"), TTL).await.unwrap();

        assert_eq!(cache.len(), 4);
        assert_eq!(cache.get("b").await.unwrap(), None);
        for key in ["a", "c", "d", "e"] {
            assert!(cache.get(key).await.unwrap().is_some(), "lost {key}");
        }
    }

    #[tokio::test]
    async fn size_never_exceeds_capacity() {
        let cache = LocalCache::new(3);
        for i in 0..50 {
            cache.set(&format!("k{i}"), json!(i), TTL).await.unwrap();
            assert!(cache.len() <= 3);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn error_write_does_not_displace_live_success() {
        let cache = LocalCache::new(10);
        let success = json!({"statusCode": 200, "data": {}, "result": 42});
        let error = json!({"statusCode": 502, "errorMessage": "provider down"});

        cache.set("k", success.clone(), Duration::from_secs(10)).await.unwrap();
        cache.set("k", error.clone(), Duration::from_secs(10)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(success));

        // Once the success entry expires the error may land.
        tokio::time::advance(Duration::from_secs(11)).await;
        cache.set("k", error.clone(), Duration::from_secs(10)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(error));
    }

    #[tokio::test]
    async fn success_write_overwrites_error() {
        let cache = LocalCache::new(10);
        let error = json!({"statusCode": 502, "errorMessage": "provider down"});
        let success = json!({"statusCode": 200, "data": {}, "result": 42});

        cache.set("k", error, TTL).await.unwrap();
        cache.set("k", success.clone(), TTL).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(success));
    }

    #[tokio::test]
    async fn delete_then_reinsert_reuses_slots() {
        let cache = LocalCache::new(2);
        cache.set("a", json!(1), TTL).await.unwrap();
        cache.delete("a").await.unwrap();
        assert_eq!(cache.get("a").await.unwrap(), None);
        cache.set("b", json!(2), TTL).await.unwrap();
        cache.set("c", json!(3), TTL).await.unwrap();
        cache.set("d", json!(4), TTL).await.unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("d").await.unwrap(), Some(json!(4)));
    }

    #[tokio::test]
    async fn set_many_applies_every_entry() {
        let cache = LocalCache::new(10);
        cache
            .set_many(
                vec![("a".into(), json!(1)), ("b".into(), json!(2))],
                TTL,
            )
            .await
            .unwrap();
        assert_eq!(cache.get("a").await.unwrap(), Some(json!(1)));
        assert_eq!(cache.get("b").await.unwrap(), Some(json!(2)));
    }
}
