//! Redis-backed cache variant shared across replicas.
//!
//! Values are stored as JSON strings with millisecond TTLs (`SET ... PX`).
//! Batch writes execute as one pipelined `MULTI`/`EXEC` transaction, a single
//! round trip. Writes are last-write-wins; the writer replica is trusted not
//! to emit error writes over fresh success entries.
//!
//! Read failures degrade to cache misses, logged at most once per window.
//! Write failures always surface to the caller.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde_json::Value;
use tokio::time::Instant;

use crate::cache::Cache;
use crate::error::CacheError;

/// Minimum delay between repeated read-failure warnings.
const READ_FAILURE_LOG_WINDOW: Duration = Duration::from_secs(30);

/// Cache backed by a Redis-compatible server.
pub struct RemoteCache {
    conn: MultiplexedConnection,
    last_read_warn: Mutex<Option<Instant>>,
}

impl RemoteCache {
    /// Connects to the server at `url` using a multiplexed connection that
    /// every clone of this cache shares.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(CacheError::from)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(CacheError::from)?;
        Ok(Self {
            conn,
            last_read_warn: Mutex::new(None),
        })
    }

    /// Wraps an existing connection; used by the lock and the subscription
    /// set so one process keeps a single connection pool.
    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            last_read_warn: Mutex::new(None),
        }
    }

    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    fn warn_read_failure(&self, key: &str, err: &redis::RedisError) {
        let mut last = self.last_read_warn.lock();
        let now = Instant::now();
        let due = last
            .map(|at| now.duration_since(at) >= READ_FAILURE_LOG_WINDOW)
            .unwrap_or(true);
        if due {
            *last = Some(now);
            tracing::warn!(key = %key, error = %err, "cache read failed, treating as miss");
        }
    }
}

#[async_trait]
impl Cache for RemoteCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = match conn.get(key).await {
            Ok(raw) => raw,
            Err(e) => {
                self.warn_read_failure(key, &e);
                return Ok(None);
            }
        };
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(&value)?;
        redis::cmd("SET")
            .arg(key)
            .arg(json)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<()>(&mut conn)
            .await
            .map_err(CacheError::from)
    }

    async fn set_many(
        &self,
        entries: Vec<(String, Value)>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let ttl_ms = ttl.as_millis() as u64;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in &entries {
            let json = serde_json::to_string(value)?;
            pipe.cmd("SET").arg(key).arg(json).arg("PX").arg(ttl_ms).ignore();
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(CacheError::from)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(CacheError::from)
    }
}

// Integration coverage for this variant lives behind a live server; the
// shared contract is exercised against the local variant in tests/cache.rs.
