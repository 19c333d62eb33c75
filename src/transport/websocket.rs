//! WebSocket subscriber transport.
//!
//! Keeps one persistent connection to the provider and reconciles it against
//! the subscription set on every background cycle:
//!
//! 1. Recompute the desired URL. User code receives the count of cycles that
//!    found the connection unusable and can rotate through fallback URLs.
//! 2. Tear down the connection when the URL changed or the connection has
//!    gone quiet past the unresponsive TTL. A connection younger than one
//!    second is allowed to reach that age first.
//! 3. (Re)open when there is anything to subscribe, with an open timeout.
//! 4. Send only the subscribe/unsubscribe delta between what the provider
//!    was last told and what is desired now.
//!
//! Inbound messages are handled by a reader task that parses, stamps stream
//! timestamps, and writes batches to the cache. An optional heartbeat task
//! keeps quiet providers from dropping the connection.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::OnceCell;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::config::Settings;
use crate::error::AdapterError;
use crate::params::RequestParams;
use crate::response::{ProviderResult, ResponseTimestamps, unix_ms_now};
use crate::transport::{
    AdapterRequest, Backoff, SubscriptionDriver, Transport, TransportInit,
};

/// Minimum age a connection must reach before a cycle may tear it down.
const MIN_CONNECTION_AGE: Duration = Duration::from_millis(1000);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// User-supplied protocol hooks for a WebSocket endpoint.
pub trait WsEndpoint: Send + Sync + 'static {
    /// The connection URL for the currently desired subscriptions.
    /// `failover_attempts` counts consecutive cycles without a usable
    /// connection and resets to zero after a successful open.
    fn url(
        &self,
        desired: &[RequestParams],
        failover_attempts: u32,
        settings: &Settings,
    ) -> Result<String, AdapterError>;

    /// Subscribe frame for one parameter tuple. `None` sends the raw
    /// canonical parameters.
    fn subscribe_message(&self, _params: &RequestParams) -> Option<Value> {
        None
    }

    /// Unsubscribe frame for one parameter tuple. `None` sends the raw
    /// canonical parameters.
    fn unsubscribe_message(&self, _params: &RequestParams) -> Option<Value> {
        None
    }

    /// Heartbeat frame sent every `WS_HEARTBEAT_INTERVAL_MS` while the
    /// connection is open. `None` disables the application heartbeat; a
    /// protocol-level ping is sent instead.
    fn heartbeat_message(&self) -> Option<Value> {
        None
    }

    /// Maps one inbound message to zero or more per-tuple results.
    fn handle_message(
        &self,
        message: &Value,
        settings: &Settings,
    ) -> Result<Vec<ProviderResult>, AdapterError>;
}

struct WsConnection {
    url: String,
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    opened_at: Instant,
    opened_at_unix_ms: u64,
    local_subs: Vec<RequestParams>,
    reader: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
}

impl WsConnection {
    async fn close(self) {
        {
            let mut sink = self.sink.lock().await;
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            };
            if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                tracing::debug!(error = %e, "websocket close frame failed");
            }
        }
        self.reader.abort();
        if let Some(heartbeat) = self.heartbeat {
            heartbeat.abort();
        }
    }
}

struct WsState {
    init: TransportInit,
    driver: SubscriptionDriver,
    conn: tokio::sync::Mutex<Option<WsConnection>>,
    /// Unix ms of the last message that produced a non-empty batch;
    /// zero before the first one.
    last_message_unix_ms: Arc<AtomicU64>,
    failover_attempts: AtomicU32,
}

/// The WebSocket subscriber transport.
pub struct WsTransport<E> {
    endpoint: Arc<E>,
    state: OnceCell<WsState>,
}

impl<E: WsEndpoint> WsTransport<E> {
    pub fn new(endpoint: E) -> Self {
        Self {
            endpoint: Arc::new(endpoint),
            state: OnceCell::new(),
        }
    }

    fn state(&self) -> Result<&WsState, AdapterError> {
        self.state.get().ok_or_else(|| {
            AdapterError::Internal("websocket transport used before initialize".into())
        })
    }

    /// Count of consecutive cycles without a usable connection, as threaded
    /// into the user URL builder.
    pub fn failover_attempts(&self) -> u32 {
        self.state
            .get()
            .map(|s| s.failover_attempts.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    async fn cycle(&self, state: &WsState, desired: Vec<RequestParams>) -> Result<(), AdapterError> {
        let init = &state.init;
        let subs = &init.settings.subscriptions;
        let mut conn_guard = state.conn.lock().await;

        // A reader that stopped means the provider closed on us.
        if conn_guard
            .as_ref()
            .map(|c| c.reader.is_finished())
            .unwrap_or(false)
        {
            if let Some(conn) = conn_guard.take() {
                tracing::info!(endpoint = %init.endpoint_name, url = %conn.url, "websocket connection lost");
                conn.close().await;
            }
        }

        if let Some(conn) = conn_guard.as_ref() {
            let now_ms = unix_ms_now();
            let last_msg = state.last_message_unix_ms.load(Ordering::Relaxed);
            let since_message = if last_msg == 0 {
                u64::MAX
            } else {
                now_ms.saturating_sub(last_msg)
            };
            let since_open = now_ms.saturating_sub(conn.opened_at_unix_ms);
            let unresponsive = since_message.min(since_open)
                > subs.ws_subscription_unresponsive_ttl.as_millis() as u64;
            if unresponsive {
                state.failover_attempts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    endpoint = %init.endpoint_name,
                    url = %conn.url,
                    "websocket connection unresponsive"
                );
            }

            let desired_url = self.endpoint.url(
                &desired,
                state.failover_attempts.load(Ordering::Relaxed),
                &init.settings,
            )?;

            if conn.url != desired_url || unresponsive {
                let age = conn.opened_at.elapsed();
                if age < MIN_CONNECTION_AGE {
                    tokio::time::sleep(MIN_CONNECTION_AGE - age).await;
                }
                if let Some(conn) = conn_guard.take() {
                    tracing::info!(endpoint = %init.endpoint_name, url = %conn.url, "closing websocket connection");
                    conn.close().await;
                }
            }
        }

        if conn_guard.is_none() {
            if desired.is_empty() {
                return Ok(());
            }
            let url = self.endpoint.url(
                &desired,
                state.failover_attempts.load(Ordering::Relaxed),
                &init.settings,
            )?;
            let connection = self.open(state, &url, subs.ws_connection_open_timeout).await?;
            *conn_guard = Some(connection);
        }

        if let Some(conn) = conn_guard.as_mut() {
            self.reconcile_subscriptions(init, conn, desired).await?;
        }
        Ok(())
    }

    async fn open(
        &self,
        state: &WsState,
        url: &str,
        open_timeout: Duration,
    ) -> Result<WsConnection, AdapterError> {
        let init = &state.init;
        tracing::info!(endpoint = %init.endpoint_name, url = %url, "opening websocket connection");

        let connected = tokio::time::timeout(open_timeout, connect_async(url)).await;
        let (stream, _response) = match connected {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                state.failover_attempts.fetch_add(1, Ordering::Relaxed);
                return Err(AdapterError::Connection(format!(
                    "websocket open failed for {url}: {e}"
                )));
            }
            Err(_) => {
                state.failover_attempts.fetch_add(1, Ordering::Relaxed);
                return Err(AdapterError::Timeout(format!(
                    "websocket open timed out after {} ms for {url}",
                    open_timeout.as_millis()
                )));
            }
        };

        state.failover_attempts.store(0, Ordering::Relaxed);
        state.last_message_unix_ms.store(0, Ordering::Relaxed);

        let opened_at_unix_ms = unix_ms_now();
        let (sink, source) = stream.split();
        let sink = Arc::new(tokio::sync::Mutex::new(sink));

        let reader = tokio::spawn(reader_loop(
            source,
            self.endpoint.clone(),
            init.clone(),
            state.last_message_unix_ms.clone(),
            opened_at_unix_ms,
        ));

        let heartbeat = self.endpoint.heartbeat_message().is_some().then(|| {
            tokio::spawn(heartbeat_loop(
                sink.clone(),
                self.endpoint.clone(),
                init.settings.subscriptions.ws_heartbeat_interval,
            ))
        });

        Ok(WsConnection {
            url: url.to_string(),
            sink,
            opened_at: Instant::now(),
            opened_at_unix_ms,
            local_subs: Vec::new(),
            reader,
            heartbeat,
        })
    }

    /// Sends the subscribe/unsubscribe delta and commits the new local view
    /// only after every frame went out.
    async fn reconcile_subscriptions(
        &self,
        init: &TransportInit,
        conn: &mut WsConnection,
        desired: Vec<RequestParams>,
    ) -> Result<(), AdapterError> {
        let local: HashSet<String> = conn.local_subs.iter().map(|p| p.canonical()).collect();
        let desired_set: HashSet<String> = desired.iter().map(|p| p.canonical()).collect();

        let mut frames = Vec::new();
        for params in desired.iter().filter(|p| !local.contains(&p.canonical())) {
            let value = self
                .endpoint
                .subscribe_message(params)
                .unwrap_or_else(|| Value::String(params.canonical()));
            frames.push(serde_json::to_string(&value).unwrap_or_default());
        }
        for params in conn
            .local_subs
            .iter()
            .filter(|p| !desired_set.contains(&p.canonical()))
        {
            let value = self
                .endpoint
                .unsubscribe_message(params)
                .unwrap_or_else(|| Value::String(params.canonical()));
            frames.push(serde_json::to_string(&value).unwrap_or_default());
        }

        if !frames.is_empty() {
            let mut sink = conn.sink.lock().await;
            for frame in frames {
                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                    return Err(AdapterError::Connection(format!(
                        "websocket subscription frame failed for {}: {e}",
                        init.endpoint_name
                    )));
                }
            }
        }

        conn.local_subs = desired;
        Ok(())
    }
}

#[async_trait]
impl<E: WsEndpoint> Transport for WsTransport<E> {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn has_background(&self) -> bool {
        true
    }

    fn tick_floor_ms(&self, settings: &Settings) -> u64 {
        settings.subscriptions.background_execute_ms_ws
    }

    async fn initialize(&self, init: TransportInit) -> Result<(), AdapterError> {
        let subs = &init.settings.subscriptions;
        let driver = SubscriptionDriver::new(
            init.subscription_set.clone(),
            subs.ws_subscription_ttl,
            Backoff::new(
                subs.stream_handler_retry_min_ms,
                subs.stream_handler_retry_exp_factor,
                subs.stream_handler_retry_max_ms,
            ),
            init.endpoint_name.clone(),
            self.name(),
            init.metrics.clone(),
        );
        self.state
            .set(WsState {
                init,
                driver,
                conn: tokio::sync::Mutex::new(None),
                last_message_unix_ms: Arc::new(AtomicU64::new(0)),
                failover_attempts: AtomicU32::new(0),
            })
            .map_err(|_| AdapterError::Setup("websocket transport initialized twice".into()))
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

async fn reader_loop<E: WsEndpoint>(
    mut source: WsSource,
    endpoint: Arc<E>,
    init: TransportInit,
    last_message_unix_ms: Arc<AtomicU64>,
    opened_at_unix_ms: u64,
) {
    while let Some(message) = source.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(endpoint = %init.endpoint_name, error = %e, "websocket read failed");
                break;
            }
        };

        let value: Value = match serde_json::from_str(text.as_str()) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(endpoint = %init.endpoint_name, error = %e, "unparseable websocket message");
                continue;
            }
        };

        let results = match endpoint.handle_message(&value, &init.settings) {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(endpoint = %init.endpoint_name, error = %e, "websocket message handler failed");
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

        // The provider spoke; the connection is alive whether or not the
        // write below lands.
        last_message_unix_ms.store(unix_ms_now(), Ordering::Relaxed);

        if let Err(e) = init
            .response_cache
            .write(&init.endpoint_name, "websocket", &init.input_fields, stamped)
            .await
        {
            tracing::warn!(endpoint = %init.endpoint_name, error = %e, "websocket batch write failed");
        }
    }
}

async fn heartbeat_loop<E: WsEndpoint>(
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    endpoint: Arc<E>,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        let frame = match endpoint.heartbeat_message() {
            Some(value) => Message::Text(
                serde_json::to_string(&value).unwrap_or_default().into(),
            ),
            None => Message::Ping(Vec::new().into()),
        };
        let mut sink = sink.lock().await;
        if let Err(e) = sink.send(frame).await {
            tracing::debug!(error = %e, "websocket heartbeat failed, stopping");
            return;
        }
    }
}
