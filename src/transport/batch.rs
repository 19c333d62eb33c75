//! Background batch-HTTP transport.
//!
//! On every cycle the transport reads all desired parameter tuples, lets the
//! user group them into one or more provider requests, executes the groups
//! concurrently through the shared requester, parses each response into
//! per-tuple results, and writes every group as one cache batch.
//!
//! Upstream failures never stop the loop: a non-2xx status becomes a 502
//! error entry per parameter tuple with the upstream status echoed in the
//! message, and connection-level failures additionally engage the backoff
//! window.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use once_cell::sync::OnceCell;
use tokio::time::Instant;

use crate::config::Settings;
use crate::error::AdapterError;
use crate::params::RequestParams;
use crate::requester::{ProviderRequest, ProviderResponse};
use crate::response::{
    AdapterResponse, ErrorResponse, ProviderResult, ResponseTimestamps, unix_ms_now,
};
use crate::transport::{
    AdapterRequest, Backoff, SubscriptionDriver, Transport, TransportInit,
};

/// One provider request covering a subset of the desired parameter tuples.
#[derive(Clone, Debug)]
pub struct BatchRequestGroup {
    pub params: Vec<RequestParams>,
    pub request: ProviderRequest,
}

/// User-supplied request shaping and response parsing for a batch endpoint.
pub trait BatchEndpoint: Send + Sync + 'static {
    /// Groups the desired parameter tuples into provider requests. Most
    /// providers take one batched request; some need one request per tuple.
    fn prepare_requests(
        &self,
        params: &[RequestParams],
        settings: &Settings,
    ) -> Result<Vec<BatchRequestGroup>, AdapterError>;

    /// Parses one group's response into per-tuple results.
    fn parse_response(
        &self,
        params: &[RequestParams],
        response: &ProviderResponse,
        settings: &Settings,
    ) -> Result<Vec<ProviderResult>, AdapterError>;
}

struct BatchState {
    init: TransportInit,
    driver: SubscriptionDriver,
}

/// The background batch-HTTP transport.
pub struct BatchTransport<E> {
    endpoint: E,
    state: OnceCell<BatchState>,
}

impl<E: BatchEndpoint> BatchTransport<E> {
    pub fn new(endpoint: E) -> Self {
        Self {
            endpoint,
            state: OnceCell::new(),
        }
    }

    fn state(&self) -> Result<&BatchState, AdapterError> {
        self.state
            .get()
            .ok_or_else(|| AdapterError::Internal("batch transport used before initialize".into()))
    }

    async fn handle(&self, state: &BatchState, entries: Vec<RequestParams>) -> Result<(), AdapterError> {
        let init = &state.init;
        let subs = &init.settings.subscriptions;

        if entries.is_empty() {
            init.metrics
                .cache_warmer
                .with_label_values(&[init.endpoint_name.as_str()])
                .set(0);
            tokio::time::sleep(Duration::from_millis(subs.background_execute_ms_http)).await;
            return Ok(());
        }
        init.metrics
            .cache_warmer
            .with_label_values(&[init.endpoint_name.as_str()])
            .set(1);

        let started = Instant::now();
        let groups = self.endpoint.prepare_requests(&entries, &init.settings)?;
        let outcomes = join_all(groups.into_iter().map(|group| self.run_group(init, group))).await;

        let elapsed = started.elapsed();
        if elapsed > subs.warmup_subscription_ttl || elapsed > init.settings.cache.max_age {
            tracing::warn!(
                endpoint = %init.endpoint_name,
                elapsed_ms = elapsed.as_millis() as u64,
                "batch cycle outlasted entry TTLs, cached values may have expired mid-flight"
            );
        }

        // Surface the first hard failure so the backoff window engages;
        // per-entry error responses were already written above.
        outcomes.into_iter().find(|o| o.is_err()).unwrap_or(Ok(()))
    }

    async fn run_group(
        &self,
        init: &TransportInit,
        group: BatchRequestGroup,
    ) -> Result<(), AdapterError> {
        let requested_unix_ms = unix_ms_now();
        let fingerprint = group_fingerprint(&group.params);

        match init.requester.request(fingerprint, group.request.clone()).await {
            Ok(response) if response.is_success() => {
                let results =
                    self.endpoint
                        .parse_response(&group.params, &response, &init.settings)?;
                let stamped = results
                    .into_iter()
                    .map(|r| {
                        let response = r
                            .response
                            .into_response(ResponseTimestamps::synchronous(requested_unix_ms));
                        (r.params, response)
                    })
                    .collect();
                init.response_cache
                    .write(&init.endpoint_name, self.name(), &init.input_fields, stamped)
                    .await?;
                Ok(())
            }
            Ok(response) => {
                let message = format!(
                    "Provider returned {}: {}",
                    response.status,
                    String::from_utf8_lossy(&response.body)
                        .chars()
                        .take(256)
                        .collect::<String>()
                );
                self.write_error_entries(init, &group.params, 502, &message, requested_unix_ms)
                    .await?;
                Ok(())
            }
            Err(e) => {
                let error = AdapterError::from(e);
                self.write_error_entries(
                    init,
                    &group.params,
                    error.status_code(),
                    &error.to_string(),
                    requested_unix_ms,
                )
                .await?;
                Err(error)
            }
        }
    }

    async fn write_error_entries(
        &self,
        init: &TransportInit,
        params: &[RequestParams],
        status_code: u16,
        message: &str,
        requested_unix_ms: u64,
    ) -> Result<(), AdapterError> {
        let entries = params
            .iter()
            .map(|p| {
                let response = AdapterResponse::Error(ErrorResponse {
                    status_code,
                    error_message: message.to_string(),
                    timestamps: ResponseTimestamps::synchronous(requested_unix_ms),
                });
                (p.clone(), response)
            })
            .collect();
        init.response_cache
            .write(&init.endpoint_name, self.name(), &init.input_fields, entries)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<E: BatchEndpoint> Transport for BatchTransport<E> {
    fn name(&self) -> &'static str {
        "batch"
    }

    fn has_background(&self) -> bool {
        true
    }

    fn tick_floor_ms(&self, settings: &Settings) -> u64 {
        settings.subscriptions.background_execute_ms_http
    }

    async fn initialize(&self, init: TransportInit) -> Result<(), AdapterError> {
        let subs = &init.settings.subscriptions;
        let driver = SubscriptionDriver::new(
            init.subscription_set.clone(),
            subs.warmup_subscription_ttl,
            Backoff::new(
                subs.subscription_retry_min_ms,
                subs.subscription_retry_exp_factor,
                subs.subscription_retry_max_ms,
            ),
            init.endpoint_name.clone(),
            self.name(),
            init.metrics.clone(),
        );
        self.state
            .set(BatchState { init, driver })
            .map_err(|_| AdapterError::Setup("batch transport initialized twice".into()))
    }

    async fn register_request(&self, request: &AdapterRequest) -> Result<(), AdapterError> {
        self.state()?.driver.register(request).await
    }

    async fn background_execute(&self) -> Result<(), AdapterError> {
        let state = self.state()?;
        state
            .driver
            .run_cycle(|entries| self.handle(state, entries))
            .await
    }
}

/// Requester fingerprint for a group: the sorted canonical forms of every
/// tuple, joined with `|`.
fn group_fingerprint(params: &[RequestParams]) -> String {
    let mut canonicals: Vec<String> = params.iter().map(|p| p.canonical()).collect();
    canonicals.sort();
    canonicals.join("|")
}
