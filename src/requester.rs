//! Outbound HTTP requester.
//!
//! All provider HTTP traffic funnels through one bounded queue. Queueing
//! gives three properties the transports rely on:
//!
//! - **Coalescing**: requests are keyed by a caller-supplied fingerprint.
//!   A request whose fingerprint is already queued or in flight attaches to
//!   the existing one and shares its outcome.
//! - **Bounded memory**: when the queue is full, the oldest queued request
//!   is evicted and its waiters fail with a queue-overflow error.
//! - **Retry policy**: connection-level failures retry with exponential
//!   backoff and jitter. Timeouts do not retry and surface directly as
//!   provider-timeout errors.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{Notify, oneshot};

use crate::error::AdapterError;
use crate::metrics::Metrics;
use crate::shutdown::Shutdown;

/// A provider request as produced by user `prepare` callbacks.
#[derive(Clone, Debug)]
pub struct ProviderRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ProviderRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Raw provider response. Status interpretation is the transport's job.
#[derive(Clone, Debug)]
pub struct ProviderResponse {
    pub status: u16,
    pub body: Bytes,
}

impl ProviderResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parses the body as JSON.
    pub fn json(&self) -> Result<Value, RequesterError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| RequesterError::BadResponse(e.to_string()))
    }
}

/// Requester-level failures. Cloneable so one outcome can fan out to every
/// coalesced waiter.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RequesterError {
    #[error("provider request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("provider connection failed: {0}")]
    Connection(String),

    #[error("request queue overflowed, the request was evicted before dispatch")]
    QueueOverflow,

    #[error("invalid provider request: {0}")]
    BadRequest(String),

    #[error("unreadable provider response: {0}")]
    BadResponse(String),
}

impl From<RequesterError> for AdapterError {
    fn from(err: RequesterError) -> Self {
        match err {
            RequesterError::Timeout { .. } => AdapterError::Timeout(err.to_string()),
            RequesterError::Connection(msg) => AdapterError::Connection(msg),
            RequesterError::QueueOverflow => AdapterError::RateLimit(err.to_string()),
            RequesterError::BadRequest(msg) | RequesterError::BadResponse(msg) => {
                AdapterError::Custom(msg)
            }
        }
    }
}

type Waiter = oneshot::Sender<Result<ProviderResponse, RequesterError>>;

struct PendingEntry {
    request: ProviderRequest,
    waiters: Vec<Waiter>,
}

#[derive(Default)]
struct QueueState {
    /// Fingerprints waiting for dispatch, oldest first. The entry currently
    /// executing is tracked separately so it can never be evicted.
    order: VecDeque<String>,
    entries: HashMap<String, PendingEntry>,
    in_flight: Option<String>,
}

/// Requester configuration, lifted from [`crate::config::RequesterSettings`].
#[derive(Clone, Debug)]
pub struct RequesterConfig {
    pub retries: u32,
    pub timeout: Duration,
    pub max_queue_length: usize,
}

struct Inner {
    client: reqwest::Client,
    config: RequesterConfig,
    state: parking_lot::Mutex<QueueState>,
    notify: Notify,
    metrics: Arc<Metrics>,
}

/// Cloneable handle to the shared request queue.
#[derive(Clone)]
pub struct Requester {
    inner: Arc<Inner>,
}

impl Requester {
    /// Builds the requester and spawns its dispatch worker.
    pub fn new(config: RequesterConfig, metrics: Arc<Metrics>, shutdown: Shutdown) -> Self {
        let client = reqwest::Client::new();
        let inner = Arc::new(Inner {
            client,
            config,
            state: parking_lot::Mutex::new(QueueState::default()),
            notify: Notify::new(),
            metrics,
        });

        let worker = inner.clone();
        tokio::spawn(async move {
            dispatch_loop(worker, shutdown).await;
        });

        Self { inner }
    }

    /// Enqueues a request, or attaches to an identical one already queued or
    /// in flight, and waits for its outcome.
    pub async fn request(
        &self,
        fingerprint: impl Into<String>,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, RequesterError> {
        let fingerprint = fingerprint.into();
        let (tx, rx) = oneshot::channel();
        let mut evicted: Option<Vec<Waiter>> = None;

        {
            let mut state = self.inner.state.lock();
            if let Some(entry) = state.entries.get_mut(&fingerprint) {
                entry.waiters.push(tx);
            } else {
                if state.order.len() >= self.inner.config.max_queue_length {
                    if let Some(oldest) = state.order.pop_front() {
                        evicted = state.entries.remove(&oldest).map(|e| e.waiters);
                        tracing::warn!(
                            fingerprint = %oldest,
                            "request queue full, evicting oldest queued request"
                        );
                    }
                }
                state.entries.insert(
                    fingerprint.clone(),
                    PendingEntry {
                        request,
                        waiters: vec![tx],
                    },
                );
                state.order.push_back(fingerprint);
                self.inner
                    .metrics
                    .http_request_queue_depth
                    .set(state.order.len() as i64);
                self.inner.notify.notify_one();
            }
        }

        if let Some(waiters) = evicted {
            self.inner.metrics.http_request_queue_overflow_count.inc();
            for waiter in waiters {
                let _ = waiter.send(Err(RequesterError::QueueOverflow));
            }
        }

        rx.await
            .map_err(|_| RequesterError::Connection("request abandoned during shutdown".into()))?
    }

    /// Number of requests currently queued, excluding the one in flight.
    pub fn queue_depth(&self) -> usize {
        self.inner.state.lock().order.len()
    }
}

async fn dispatch_loop(inner: Arc<Inner>, shutdown: Shutdown) {
    loop {
        let next = {
            let mut state = inner.state.lock();
            match state.order.pop_front() {
                Some(fp) => match state.entries.get(&fp).map(|e| e.request.clone()) {
                    Some(request) => {
                        state.in_flight = Some(fp.clone());
                        inner
                            .metrics
                            .http_request_queue_depth
                            .set(state.order.len() as i64);
                        Some((fp, request))
                    }
                    None => continue,
                },
                None => None,
            }
        };

        let Some((fingerprint, request)) = next else {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = inner.notify.notified() => continue,
            }
        };

        let outcome = execute(&inner.client, &request, &inner.config).await;
        if let Err(e) = &outcome {
            tracing::warn!(fingerprint = %fingerprint, error = %e, "provider request failed");
        }

        let waiters = {
            let mut state = inner.state.lock();
            state.in_flight = None;
            state
                .entries
                .remove(&fingerprint)
                .map(|e| e.waiters)
                .unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }

        if shutdown.is_triggered() {
            return;
        }
    }
}

async fn execute(
    client: &reqwest::Client,
    request: &ProviderRequest,
    config: &RequesterConfig,
) -> Result<ProviderResponse, RequesterError> {
    let url = reqwest::Url::parse(&request.url)
        .map_err(|e| RequesterError::BadRequest(format!("{}: {e}", request.url)))?;

    let mut attempt: u32 = 0;
    loop {
        let mut builder = client
            .request(request.method.clone(), url.clone())
            .timeout(config.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| RequesterError::Connection(e.to_string()))?;
                return Ok(ProviderResponse { status, body });
            }
            Err(e) if e.is_timeout() => {
                return Err(RequesterError::Timeout {
                    timeout_ms: config.timeout.as_millis() as u64,
                });
            }
            Err(e) if e.is_builder() => {
                return Err(RequesterError::BadRequest(e.to_string()));
            }
            Err(e) => {
                if attempt >= config.retries {
                    return Err(RequesterError::Connection(e.to_string()));
                }
                let backoff = backoff_ms(attempt);
                tracing::warn!(
                    url = %request.url,
                    attempt,
                    backoff_ms = backoff,
                    error = %e,
                    "provider request failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                attempt += 1;
            }
        }
    }
}

/// `(2^attempt + jitter) * 1000` milliseconds, with sub-second jitter.
fn backoff_ms(attempt: u32) -> u64 {
    let base = 2u64.saturating_pow(attempt).saturating_mul(1000);
    let jitter = rand::thread_rng().gen_range(0..1000);
    base.saturating_add(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_grows_exponentially_with_jitter() {
        for attempt in 0..4 {
            let ms = backoff_ms(attempt);
            let base = 2u64.pow(attempt) * 1000;
            assert!(ms >= base && ms < base + 1000, "attempt {attempt}: {ms}");
        }
    }

    #[test]
    fn provider_response_json_parsing() {
        let response = ProviderResponse {
            status: 200,
            body: Bytes::from(r#"{"price": 42}"#),
        };
        assert!(response.is_success());
        assert_eq!(response.json().unwrap()["price"], 42);

        let junk = ProviderResponse {
            status: 502,
            body: Bytes::from("not json"),
        };
        assert!(!junk.is_success());
        assert!(junk.json().is_err());
    }

    #[test]
    fn request_builders() {
        let request = ProviderRequest::post("https://api.example.com/q", json!({"ids": ["eth"]}))
            .with_header("x-api-key", "k");
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.headers.len(), 1);
        assert!(request.body.is_some());
    }

    #[test]
    fn requester_error_maps_onto_adapter_statuses() {
        let timeout: AdapterError = RequesterError::Timeout { timeout_ms: 5 }.into();
        assert_eq!(timeout.status_code(), 504);
        let overflow: AdapterError = RequesterError::QueueOverflow.into();
        assert_eq!(overflow.status_code(), 429);
        let conn: AdapterError = RequesterError::Connection("refused".into()).into();
        assert_eq!(conn.status_code(), 502);
        assert_eq!(conn.provider_status_code(), Some(0));
    }
}
