//! Distributed writer lock.
//!
//! A replica running in a writer mode against the remote cache must be the
//! only writer for its adapter namespace. The lock is a plain Redis lease:
//! `SET {prefix-}{adapter}-lock {replica_id} NX PX {duration}`. A background
//! task re-extends the lease at half its duration while the process runs;
//! shutdown cancels the extension and releases the key.

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::CacheError;
use crate::shutdown::Shutdown;

/// An acquired writer lease.
pub struct DistributedLock {
    conn: MultiplexedConnection,
    key: String,
    replica_id: String,
    duration: Duration,
}

impl DistributedLock {
    /// Attempts to acquire the lock, retrying `retries` additional times
    /// spread across one lease duration. Failure to acquire is fatal to the
    /// caller: another writer already owns the namespace.
    pub async fn acquire(
        conn: MultiplexedConnection,
        key: String,
        duration: Duration,
        retries: u32,
    ) -> Result<Self, CacheError> {
        let replica_id = Uuid::new_v4().to_string();
        let retry_delay = duration / (retries + 1).max(1);

        for attempt in 0..=retries {
            let mut c = conn.clone();
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&replica_id)
                .arg("NX")
                .arg("PX")
                .arg(duration.as_millis() as u64)
                .query_async(&mut c)
                .await?;

            if acquired.is_some() {
                tracing::info!(key = %key, replica_id = %replica_id, "writer lock acquired");
                return Ok(Self {
                    conn,
                    key,
                    replica_id,
                    duration,
                });
            }

            if attempt < retries {
                tracing::debug!(key = %key, attempt, "writer lock held elsewhere, retrying");
                tokio::time::sleep(retry_delay).await;
            }
        }

        Err(CacheError::QuorumNotReached { key })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Spawns the lease-extension task. It renews at half the lease duration
    /// and stops as soon as shutdown triggers, so extension can never overlap
    /// with release. Losing the lease mid-run triggers shutdown: continuing
    /// to write without the lock would mean two writers on one namespace.
    pub fn spawn_extension(&self, shutdown: Shutdown) -> JoinHandle<()> {
        let conn = self.conn.clone();
        let key = self.key.clone();
        let replica_id = self.replica_id.clone();
        let duration = self.duration;
        let interval = duration / 2;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                match extend(&conn, &key, &replica_id, duration).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::error!(key = %key, "writer lock lost, shutting down");
                        shutdown.trigger();
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "writer lock extension failed");
                    }
                }
            }
        })
    }

    /// Releases the lease if this replica still holds it.
    pub async fn release(self) {
        let mut conn = self.conn.clone();
        let holder: Result<Option<String>, _> = redis::cmd("GET")
            .arg(&self.key)
            .query_async(&mut conn)
            .await;
        match holder {
            Ok(Some(id)) if id == self.replica_id => {
                if let Err(e) = redis::cmd("DEL")
                    .arg(&self.key)
                    .query_async::<()>(&mut conn)
                    .await
                {
                    tracing::warn!(key = %self.key, error = %e, "writer lock release failed");
                } else {
                    tracing::info!(key = %self.key, "writer lock released");
                }
            }
            Ok(_) => {
                tracing::warn!(key = %self.key, "writer lock no longer held at release");
            }
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "writer lock release read failed");
            }
        }
    }
}

/// Re-asserts the lease. Returns `Ok(false)` when another replica took the
/// key, which can only happen after the lease was allowed to expire.
async fn extend(
    conn: &MultiplexedConnection,
    key: &str,
    replica_id: &str,
    duration: Duration,
) -> Result<bool, CacheError> {
    let mut conn = conn.clone();
    let holder: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
    match holder.as_deref() {
        Some(id) if id == replica_id => {
            redis::cmd("PEXPIRE")
                .arg(key)
                .arg(duration.as_millis() as u64)
                .query_async::<()>(&mut conn)
                .await?;
            Ok(true)
        }
        _ => Ok(false),
    }
}
