//! Shared fixtures for the integration suites: in-process settings, the
//! dependency harness transports are wired with, and stub upstream servers.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use feedbridge::cache::{Cache, LocalCache, ResponseCache};
use feedbridge::censor::CensorList;
use feedbridge::config::{
    CacheSettings, CacheType, EaMode, MetricsSettings, RateLimitSettings, RequesterSettings,
    ServerSettings, Settings, SubscriptionSettings,
};
use feedbridge::metrics::Metrics;
use feedbridge::params::RequestParams;
use feedbridge::rate_limit::{EndpointAllocation, RateLimiter};
use feedbridge::requester::{Requester, RequesterConfig};
use feedbridge::shutdown::Shutdown;
use feedbridge::subscription::LocalSubscriptionSet;
use feedbridge::transport::TransportInit;

/// Settings tuned for fast tests: short sleeps, small backoff windows.
pub fn test_settings() -> Settings {
    Settings {
        server: ServerSettings {
            mode: EaMode::ReaderWriter,
            host: "127.0.0.1".into(),
            port: 0,
            base_url: "/".into(),
            max_payload_size_limit: 1 << 20,
            tls_enabled: false,
            mtls_enabled: false,
            tls_private_key: None,
            tls_public_key: None,
            tls_ca: None,
            tls_passphrase: None,
        },
        cache: CacheSettings {
            cache_type: CacheType::Local,
            max_items: 1000,
            max_age: Duration::from_secs(90),
            prefix: None,
            redis_url: "redis://127.0.0.1:6379".into(),
            lock_duration: Duration::from_secs(10),
            lock_retries: 3,
            polling_sleep: Duration::from_millis(20),
            polling_max_retries: 5,
        },
        subscriptions: SubscriptionSettings {
            warmup_subscription_ttl: Duration::from_secs(60),
            ws_subscription_ttl: Duration::from_secs(60),
            ws_subscription_unresponsive_ttl: Duration::from_millis(400),
            ws_heartbeat_interval: Duration::from_millis(50),
            ws_connection_open_timeout: Duration::from_secs(2),
            background_execute_ms_http: 10,
            background_execute_ms_ws: 10,
            background_execute_ms_sse: 10,
            background_execute_timeout: Duration::from_secs(10),
            subscription_retry_min_ms: 30,
            subscription_retry_exp_factor: 2.0,
            subscription_retry_max_ms: 300,
            stream_handler_retry_min_ms: 30,
            stream_handler_retry_exp_factor: 2.0,
            stream_handler_retry_max_ms: 300,
        },
        requester: RequesterSettings {
            retry: 0,
            api_timeout: Duration::from_secs(5),
            max_queue_length: 32,
            coalescing_enabled: false,
            coalescing_entropy_max: 0,
            rest_max_rate_limit_retries: 2,
            rest_ms_between_rate_limit_retries: 10,
        },
        rate_limits: RateLimitSettings::default(),
        metrics: MetricsSettings {
            enabled: true,
            port: 0,
            use_base_url: false,
        },
        custom: Vec::new(),
    }
}

/// The full dependency bundle one endpoint's transport is wired with.
pub struct Harness {
    pub settings: Arc<Settings>,
    pub cache: Arc<dyn Cache>,
    pub response_cache: Arc<ResponseCache>,
    pub metrics: Arc<Metrics>,
    pub requester: Requester,
    pub rate_limiter: Arc<RateLimiter>,
    pub subscription_set: Arc<LocalSubscriptionSet>,
    pub shutdown: Shutdown,
}

impl Harness {
    pub fn new(settings: Settings) -> Self {
        let settings = Arc::new(settings);
        let shutdown = Shutdown::new();
        let metrics = Arc::new(Metrics::new().unwrap());
        let cache: Arc<dyn Cache> = Arc::new(LocalCache::new(settings.cache.max_items));
        let response_cache = Arc::new(ResponseCache::new(
            cache.clone(),
            metrics.clone(),
            CensorList::default(),
            "TEST".into(),
            None,
            settings.cache.max_age,
            settings.metrics.enabled,
        ));
        let requester = Requester::new(
            RequesterConfig {
                retries: settings.requester.retry,
                timeout: settings.requester.api_timeout,
                max_queue_length: settings.requester.max_queue_length,
            },
            metrics.clone(),
            shutdown.clone(),
        );
        let rate_limiter = Arc::new(
            RateLimiter::new(
                None,
                &settings.rate_limits,
                &[EndpointAllocation {
                    endpoint_name: "price".into(),
                    allocation_percentage: None,
                }],
            )
            .unwrap(),
        );

        Self {
            settings,
            cache,
            response_cache,
            metrics,
            requester,
            rate_limiter,
            subscription_set: Arc::new(LocalSubscriptionSet::new()),
            shutdown,
        }
    }

    pub fn init_for(&self, endpoint_name: &str) -> TransportInit {
        TransportInit {
            adapter_name: "TEST".into(),
            endpoint_name: endpoint_name.into(),
            input_fields: Vec::new(),
            settings: self.settings.clone(),
            response_cache: self.response_cache.clone(),
            cache: self.cache.clone(),
            requester: self.requester.clone(),
            rate_limiter: self.rate_limiter.clone(),
            metrics: self.metrics.clone(),
            subscription_set: self.subscription_set.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

pub fn params(base: &str, factor: i64) -> RequestParams {
    let mut p = RequestParams::new();
    p.insert("base", json!(base));
    p.insert("factor", json!(factor));
    p
}

/// An in-process HTTP upstream with a fixed response, an optional delay, and
/// a hit counter.
pub struct StubServer {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
}

impl StubServer {
    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }
}

pub async fn stub_http_server(status: u16, body: Value, delay: Option<Duration>) -> StubServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_inner = hits.clone();
    let body = body.to_string();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let hits = hits_inner.clone();
            let body = body.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |_req| {
                    let hits = hits.clone();
                    let body = body.clone();
                    async move {
                        hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        if let Some(delay) = delay {
                            tokio::time::sleep(delay).await;
                        }
                        Ok::<_, Infallible>(
                            hyper::Response::builder()
                                .status(status)
                                .header("content-type", "application/json")
                                .body(Full::new(Bytes::from(body)))
                                .unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    StubServer { addr, hits }
}
