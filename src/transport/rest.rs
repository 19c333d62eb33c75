//! Foreground REST transport.
//!
//! One client request maps to one upstream request. The transport waits for
//! rate-limit admission, optionally coalesces identical requests across
//! replicas through an in-flight cache marker, executes through the shared
//! requester, and writes the parsed response to the cache before returning
//! it to the caller.
//!
//! Returning `Ok(None)` signals the front door that another replica already
//! has the same request in flight; the caller falls back to polling the
//! cache for that replica's result.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use rand::Rng;
use serde_json::Value;

use crate::config::Settings;
use crate::error::AdapterError;
use crate::params::in_flight_key;
use crate::requester::{ProviderRequest, ProviderResponse};
use crate::response::{AdapterResponse, PartialResponse, ResponseTimestamps, unix_ms_now};
use crate::transport::{AdapterRequest, Transport, TransportInit};

/// User-supplied request shaping and response parsing for a REST endpoint.
pub trait RestEndpoint: Send + Sync + 'static {
    /// Builds the upstream request for one parameter tuple.
    fn prepare_request(
        &self,
        params: &crate::params::RequestParams,
        settings: &Settings,
    ) -> Result<ProviderRequest, AdapterError>;

    /// Parses a successful upstream response into a result value.
    fn parse_response(
        &self,
        params: &crate::params::RequestParams,
        response: &ProviderResponse,
        settings: &Settings,
    ) -> Result<PartialResponse, AdapterError>;
}

/// The foreground REST transport.
pub struct RestTransport<E> {
    endpoint: E,
    init: OnceCell<TransportInit>,
}

impl<E: RestEndpoint> RestTransport<E> {
    pub fn new(endpoint: E) -> Self {
        Self {
            endpoint,
            init: OnceCell::new(),
        }
    }

    fn deps(&self) -> Result<&TransportInit, AdapterError> {
        self.init
            .get()
            .ok_or_else(|| AdapterError::Internal("rest transport used before initialize".into()))
    }

    /// Waits for rate-limit admission, polling `is_under_limits` between
    /// sleeps. Exhausting the retries fails the request as a timeout.
    async fn wait_for_admission(&self, init: &TransportInit) -> Result<(), AdapterError> {
        let requester = &init.settings.requester;
        for attempt in 0..=requester.rest_max_rate_limit_retries {
            if init.rate_limiter.is_under_limits() {
                return Ok(());
            }
            if attempt < requester.rest_max_rate_limit_retries {
                tokio::time::sleep(Duration::from_millis(
                    requester.rest_ms_between_rate_limit_retries,
                ))
                .await;
            }
        }
        init.metrics
            .rest_transport_rate_limit_timeouts
            .with_label_values(&[init.endpoint_name.as_str()])
            .inc();
        Err(AdapterError::Timeout(
            "rate limit admission retries exhausted".into(),
        ))
    }

    async fn execute_upstream(
        &self,
        init: &TransportInit,
        request: &AdapterRequest,
    ) -> Result<AdapterResponse, AdapterError> {
        init.rate_limiter.record_execution();
        let requested_unix_ms = unix_ms_now();

        let provider_request = self
            .endpoint
            .prepare_request(&request.params, &init.settings)?;
        let response = init
            .requester
            .request(request.cache_key.clone(), provider_request)
            .await
            .map_err(AdapterError::from)?;

        if !response.is_success() {
            return Err(AdapterError::DataProvider {
                provider_status_code: response.status,
                message: snippet(&response),
            });
        }

        let partial = self
            .endpoint
            .parse_response(&request.params, &response, &init.settings)?;
        let adapter_response =
            partial.into_response(ResponseTimestamps::synchronous(requested_unix_ms));

        init.response_cache
            .write(
                &request.endpoint_name,
                self.name(),
                &init.input_fields,
                vec![(request.params.clone(), adapter_response.clone())],
            )
            .await?;

        Ok(adapter_response)
    }
}

#[async_trait]
impl<E: RestEndpoint> Transport for RestTransport<E> {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn initialize(&self, init: TransportInit) -> Result<(), AdapterError> {
        self.init
            .set(init)
            .map_err(|_| AdapterError::Setup("rest transport initialized twice".into()))
    }

    async fn foreground_execute(
        &self,
        request: &AdapterRequest,
    ) -> Result<Option<AdapterResponse>, AdapterError> {
        let init = self.deps()?;
        self.wait_for_admission(init).await?;

        let requester = &init.settings.requester;
        let coalescing = requester.coalescing_enabled;
        let marker_key = in_flight_key(&request.cache_key);

        if coalescing {
            // Random pre-read sleep, staggers replicas racing for the marker.
            if requester.coalescing_entropy_max > 0 {
                let jitter = {
                    let mut rng = rand::thread_rng();
                    rng.gen_range(0..requester.coalescing_entropy_max)
                };
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }

            if init.cache.get(&marker_key).await?.is_some() {
                tracing::debug!(key = %request.cache_key, "request already in flight elsewhere");
                return Ok(None);
            }

            let marker_ttl = Duration::from_millis(
                u64::from(requester.rest_max_rate_limit_retries)
                    * requester.rest_ms_between_rate_limit_retries
                    + 100,
            );
            init.cache
                .set(&marker_key, Value::Bool(true), marker_ttl)
                .await?;
        }

        let outcome = self.execute_upstream(init, request).await;

        if coalescing {
            if let Err(e) = init.cache.delete(&marker_key).await {
                tracing::warn!(key = %marker_key, error = %e, "failed to clear in-flight marker");
            }
        }

        outcome.map(Some)
    }
}

/// First bytes of a provider body, for error messages.
fn snippet(response: &ProviderResponse) -> String {
    let text = String::from_utf8_lossy(&response.body);
    let mut snippet: String = text.chars().take(256).collect();
    if text.chars().count() > 256 {
        snippet.push_str("...");
    }
    snippet
}
