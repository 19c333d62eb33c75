//! Transport contract and the shared subscription machinery.
//!
//! A transport is the algorithm that obtains values from the provider. The
//! REST transport answers foreground requests synchronously; every other
//! transport registers inbound parameters into a subscription set and relies
//! on a background loop to keep the cache warm. Transports are wired to their
//! endpoint once at startup through [`TransportInit`] and are driven by the
//! background executor afterwards.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::cache::{Cache, ResponseCache};
use crate::config::Settings;
use crate::error::AdapterError;
use crate::metrics::Metrics;
use crate::params::RequestParams;
use crate::rate_limit::RateLimiter;
use crate::requester::Requester;
use crate::shutdown::Shutdown;
use crate::subscription::SubscriptionSet;

pub mod batch;
pub mod rest;
pub mod sse;
pub mod websocket;

pub use batch::{BatchEndpoint, BatchRequestGroup, BatchTransport};
pub use rest::{RestEndpoint, RestTransport};
pub use sse::{SseEndpoint, SseEvent, SseTransport};
pub use websocket::{WsEndpoint, WsTransport};

/// A resolved inbound request: which endpoint, which parameters, and the
/// cache key the response will live under.
#[derive(Clone, Debug)]
pub struct AdapterRequest {
    pub endpoint_name: String,
    pub params: RequestParams,
    pub cache_key: String,
}

/// Everything a transport needs from the process, injected once at startup.
#[derive(Clone)]
pub struct TransportInit {
    pub adapter_name: String,
    pub endpoint_name: String,
    pub input_fields: Vec<String>,
    pub settings: Arc<Settings>,
    pub response_cache: Arc<ResponseCache>,
    pub cache: Arc<dyn Cache>,
    pub requester: Requester,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
    pub subscription_set: Arc<dyn SubscriptionSet>,
    pub shutdown: Shutdown,
}

/// Contract implemented by every transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable transport name, part of cache keys and metric labels.
    fn name(&self) -> &'static str;

    /// Whether the background executor should run a loop for this transport.
    fn has_background(&self) -> bool {
        false
    }

    /// Minimum milliseconds between background cycles, regardless of how
    /// generous the rate limiter is.
    fn tick_floor_ms(&self, _settings: &Settings) -> u64 {
        0
    }

    /// Wires the transport to its endpoint. Called exactly once.
    async fn initialize(&self, init: TransportInit) -> Result<(), AdapterError>;

    /// Synchronous upstream execution on the foreground path. `Ok(None)`
    /// means the caller should fall back to polling the cache.
    async fn foreground_execute(
        &self,
        _request: &AdapterRequest,
    ) -> Result<Option<crate::response::AdapterResponse>, AdapterError> {
        Ok(None)
    }

    /// Foreground registration of desired parameters. Idempotent; refreshes
    /// the subscription TTL on every call.
    async fn register_request(&self, _request: &AdapterRequest) -> Result<(), AdapterError> {
        Ok(())
    }

    /// One background cycle, invoked by the executor on a rate-limited
    /// cadence.
    async fn background_execute(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Exponential backoff window shared by the subscription transports.
///
/// After an error the window moves `min * factor^n` (capped at `max`) into
/// the future; cycles starting inside the window are skipped. One successful
/// cycle resets the progression.
pub struct Backoff {
    min_ms: u64,
    max_ms: u64,
    factor: f64,
    retry_count: AtomicU32,
    not_before: Mutex<Option<Instant>>,
}

impl Backoff {
    pub fn new(min_ms: u64, factor: f64, max_ms: u64) -> Self {
        Self {
            min_ms,
            max_ms,
            factor,
            retry_count: AtomicU32::new(0),
            not_before: Mutex::new(None),
        }
    }

    /// Whether the current cycle is allowed to run.
    pub fn should_run(&self) -> bool {
        match *self.not_before.lock() {
            Some(at) => Instant::now() >= at,
            None => true,
        }
    }

    pub fn on_error(&self) {
        let n = self.retry_count.fetch_add(1, Ordering::Relaxed);
        let backoff = (self.min_ms as f64 * self.factor.powi(n as i32))
            .min(self.max_ms as f64)
            .max(0.0) as u64;
        *self.not_before.lock() = Some(Instant::now() + Duration::from_millis(backoff));
    }

    pub fn on_success(&self) {
        self.retry_count.store(0, Ordering::Relaxed);
        *self.not_before.lock() = None;
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }
}

/// Shared state for transports driven by a subscription set.
pub(crate) struct SubscriptionDriver {
    pub set: Arc<dyn SubscriptionSet>,
    pub ttl: Duration,
    pub backoff: Backoff,
    pub endpoint_name: String,
    pub transport_name: &'static str,
    pub metrics: Arc<Metrics>,
}

impl SubscriptionDriver {
    pub fn new(
        set: Arc<dyn SubscriptionSet>,
        ttl: Duration,
        backoff: Backoff,
        endpoint_name: String,
        transport_name: &'static str,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            set,
            ttl,
            backoff,
            endpoint_name,
            transport_name,
            metrics,
        }
    }

    /// Foreground registration: refresh the parameters' subscription TTL.
    pub async fn register(&self, request: &AdapterRequest) -> Result<(), AdapterError> {
        self.set
            .add(&request.params, self.ttl, &request.cache_key)
            .await?;
        Ok(())
    }

    /// Runs one background cycle through the backoff gate: reads the set,
    /// records its size, invokes the handler, and advances or resets the
    /// backoff window by the outcome.
    pub async fn run_cycle<F, Fut>(&self, handler: F) -> Result<(), AdapterError>
    where
        F: FnOnce(Vec<RequestParams>) -> Fut,
        Fut: Future<Output = Result<(), AdapterError>>,
    {
        if !self.backoff.should_run() {
            tracing::debug!(
                endpoint = %self.endpoint_name,
                transport = self.transport_name,
                "background cycle skipped inside backoff window"
            );
            return Ok(());
        }

        let labels = [self.endpoint_name.as_str(), self.transport_name];
        let entries = match self.set.get_all().await {
            Ok(entries) => entries,
            Err(e) => {
                self.metrics.bg_execute_errors.with_label_values(&labels).inc();
                self.backoff.on_error();
                return Err(e.into());
            }
        };
        self.metrics
            .bg_execute_subscription_set_count
            .with_label_values(&labels)
            .set(entries.len() as i64);

        match handler(entries).await {
            Ok(()) => {
                self.backoff.on_success();
                Ok(())
            }
            Err(e) => {
                self.metrics.bg_execute_errors.with_label_values(&labels).inc();
                self.backoff.on_error();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn backoff_window_grows_and_resets() {
        let backoff = Backoff::new(100, 2.0, 1000);
        assert!(backoff.should_run());

        backoff.on_error();
        assert!(!backoff.should_run());
        tokio::time::advance(Duration::from_millis(110)).await;
        assert!(backoff.should_run());

        // Second consecutive error doubles the window.
        backoff.on_error();
        tokio::time::advance(Duration::from_millis(110)).await;
        assert!(!backoff.should_run());
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(backoff.should_run());

        backoff.on_success();
        assert_eq!(backoff.retry_count(), 0);
        backoff.on_error();
        tokio::time::advance(Duration::from_millis(110)).await;
        assert!(backoff.should_run());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_capped_at_max() {
        let backoff = Backoff::new(100, 10.0, 300);
        for _ in 0..5 {
            backoff.on_error();
        }
        tokio::time::advance(Duration::from_millis(310)).await;
        assert!(backoff.should_run());
    }
}
