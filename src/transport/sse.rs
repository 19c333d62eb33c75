//! Server-Sent Events subscriber transport.
//!
//! Maintains one EventSource connection to the provider. Each background
//! cycle establishes the stream if it is down, sends HTTP subscribe and
//! unsubscribe requests for the delta against the desired parameter set, and
//! emits an optional keep-alive ping. A reader task demultiplexes inbound
//! events through the user parser and writes batches to the cache.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use once_cell::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::error::AdapterError;
use crate::params::RequestParams;
use crate::requester::ProviderRequest;
use crate::response::{ProviderResult, ResponseTimestamps, unix_ms_now};
use crate::transport::{
    AdapterRequest, Backoff, SubscriptionDriver, Transport, TransportInit,
};

/// One inbound server-sent event.
#[derive(Clone, Debug)]
pub struct SseEvent {
    /// The event type; `message` when the stream did not name one.
    pub event_type: String,
    pub data: String,
}

/// User-supplied protocol hooks for an SSE endpoint.
pub trait SseEndpoint: Send + Sync + 'static {
    /// The stream URL for the currently desired subscriptions.
    fn url(
        &self,
        desired: &[RequestParams],
        settings: &Settings,
    ) -> Result<String, AdapterError>;

    /// HTTP request announcing interest in one parameter tuple. `None` when
    /// the provider infers subscriptions from the stream URL.
    fn subscribe_request(
        &self,
        _params: &RequestParams,
        _settings: &Settings,
    ) -> Option<ProviderRequest> {
        None
    }

    /// HTTP request withdrawing interest in one parameter tuple.
    fn unsubscribe_request(
        &self,
        _params: &RequestParams,
        _settings: &Settings,
    ) -> Option<ProviderRequest> {
        None
    }

    /// Keep-alive request sent once per background cycle while the stream
    /// is open.
    fn keepalive_request(&self, _settings: &Settings) -> Option<ProviderRequest> {
        None
    }

    /// Maps one inbound event to zero or more per-tuple results.
    fn parse_event(
        &self,
        event: &SseEvent,
        settings: &Settings,
    ) -> Result<Vec<ProviderResult>, AdapterError>;
}

struct SseConnection {
    url: String,
    local_subs: Vec<RequestParams>,
    reader: JoinHandle<()>,
}

struct SseState {
    init: TransportInit,
    driver: SubscriptionDriver,
    client: reqwest::Client,
    conn: tokio::sync::Mutex<Option<SseConnection>>,
}

/// The SSE subscriber transport.
pub struct SseTransport<E> {
    endpoint: Arc<E>,
    state: OnceCell<SseState>,
}

impl<E: SseEndpoint> SseTransport<E> {
    pub fn new(endpoint: E) -> Self {
        Self {
            endpoint: Arc::new(endpoint),
            state: OnceCell::new(),
        }
    }

    fn state(&self) -> Result<&SseState, AdapterError> {
        self.state
            .get()
            .ok_or_else(|| AdapterError::Internal("sse transport used before initialize".into()))
    }

    async fn cycle(&self, state: &SseState, desired: Vec<RequestParams>) -> Result<(), AdapterError> {
        let init = &state.init;
        let mut conn_guard = state.conn.lock().await;

        if conn_guard
            .as_ref()
            .map(|c| c.reader.is_finished())
            .unwrap_or(false)
        {
            if let Some(conn) = conn_guard.take() {
                tracing::info!(endpoint = %init.endpoint_name, url = %conn.url, "event stream lost");
                conn.reader.abort();
            }
        }

        if desired.is_empty() {
            if let Some(conn) = conn_guard.take() {
                tracing::info!(endpoint = %init.endpoint_name, url = %conn.url, "closing idle event stream");
                conn.reader.abort();
            }
            return Ok(());
        }

        if conn_guard.is_none() {
            let url = self.endpoint.url(&desired, &init.settings)?;
            *conn_guard = Some(self.open(state, &url).await?);
        }

        let Some(conn) = conn_guard.as_mut() else {
            return Ok(());
        };

        // Subscribe/unsubscribe delta goes over plain HTTP via the shared
        // requester, like any other provider call.
        let local: HashSet<String> = conn.local_subs.iter().map(|p| p.canonical()).collect();
        let desired_set: HashSet<String> = desired.iter().map(|p| p.canonical()).collect();

        for params in desired.iter().filter(|p| !local.contains(&p.canonical())) {
            if let Some(request) = self.endpoint.subscribe_request(params, &init.settings) {
                let fingerprint = format!("{}-subscribe-{}", init.endpoint_name, params.canonical());
                init.requester
                    .request(fingerprint, request)
                    .await
                    .map_err(AdapterError::from)?;
            }
        }
        for params in conn
            .local_subs
            .iter()
            .filter(|p| !desired_set.contains(&p.canonical()))
        {
            if let Some(request) = self.endpoint.unsubscribe_request(params, &init.settings) {
                let fingerprint =
                    format!("{}-unsubscribe-{}", init.endpoint_name, params.canonical());
                init.requester
                    .request(fingerprint, request)
                    .await
                    .map_err(AdapterError::from)?;
            }
        }
        conn.local_subs = desired;

        if let Some(request) = self.endpoint.keepalive_request(&init.settings) {
            let fingerprint = format!("{}-keepalive", init.endpoint_name);
            init.requester
                .request(fingerprint, request)
                .await
                .map_err(AdapterError::from)?;
        }

        Ok(())
    }

    async fn open(&self, state: &SseState, url: &str) -> Result<SseConnection, AdapterError> {
        let init = &state.init;
        tracing::info!(endpoint = %init.endpoint_name, url = %url, "opening event stream");

        let response = state
            .client
            .get(url)
            .header(http::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AdapterError::Timeout(format!("event stream open timed out for {url}"))
                } else {
                    AdapterError::Connection(format!("event stream open failed for {url}: {e}"))
                }
            })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(AdapterError::DataProvider {
                provider_status_code: status,
                message: format!("event stream open rejected for {url}"),
            });
        }

        let opened_at_unix_ms = unix_ms_now();
        let events = Box::pin(response.bytes_stream().eventsource());
        let reader = tokio::spawn(reader_loop(
            events,
            self.endpoint.clone(),
            init.clone(),
            opened_at_unix_ms,
        ));

        Ok(SseConnection {
            url: url.to_string(),
            local_subs: Vec::new(),
            reader,
        })
    }
}

#[async_trait]
impl<E: SseEndpoint> Transport for SseTransport<E> {
    fn name(&self) -> &'static str {
        "sse"
    }

    fn has_background(&self) -> bool {
        true
    }

    fn tick_floor_ms(&self, settings: &Settings) -> u64 {
        settings.subscriptions.background_execute_ms_sse
    }

    async fn initialize(&self, init: TransportInit) -> Result<(), AdapterError> {
        let subs = &init.settings.subscriptions;
        let driver = SubscriptionDriver::new(
            init.subscription_set.clone(),
            subs.warmup_subscription_ttl,
            Backoff::new(
                subs.stream_handler_retry_min_ms,
                subs.stream_handler_retry_exp_factor,
                subs.stream_handler_retry_max_ms,
            ),
            init.endpoint_name.clone(),
            self.name(),
            init.metrics.clone(),
        );
        let client = reqwest::Client::builder()
            .connect_timeout(init.settings.requester.api_timeout)
            .build()
            .map_err(|e| AdapterError::Setup(format!("sse client build failed: {e}")))?;
        self.state
            .set(SseState {
                init,
                driver,
                client,
                conn: tokio::sync::Mutex::new(None),
            })
            .map_err(|_| AdapterError::Setup("sse transport initialized twice".into()))
    }

    async fn register_request(&self, request: &AdapterRequest) -> Result<(), AdapterError> {
        self.state()?.driver.register(request).await
    }

    async fn background_execute(&self) -> Result<(), AdapterError> {
        let state = self.state()?;
        state
            .driver
            .run_cycle(|desired| self.cycle(state, desired))
            .await
    }
}

async fn reader_loop<E, S, B>(
    mut events: S,
    endpoint: Arc<E>,
    init: TransportInit,
    opened_at_unix_ms: u64,
) where
    E: SseEndpoint,
    S: futures_util::Stream<Item = Result<eventsource_stream::Event, eventsource_stream::EventStreamError<B>>>
        + Unpin
        + Send,
    B: std::fmt::Display,
{
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(endpoint = %init.endpoint_name, error = %e, "event stream read failed");
                break;
            }
        };

        let event = SseEvent {
            event_type: event.event,
            data: event.data,
        };

        let results = match endpoint.parse_event(&event, &init.settings) {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(endpoint = %init.endpoint_name, error = %e, "event handler failed");
                continue;
            }
        };
        if results.is_empty() {
            continue;
        }

        let stamped: Vec<_> = results
            .into_iter()
            .map(|r| {
                let response = r
                    .response
                    .into_response(ResponseTimestamps::streaming(opened_at_unix_ms));
                (r.params, response)
            })
            .collect();

        if let Err(e) = init
            .response_cache
            .write(&init.endpoint_name, "sse", &init.input_fields, stamped)
            .await
        {
            tracing::warn!(endpoint = %init.endpoint_name, error = %e, "event batch write failed");
        }
    }
}
