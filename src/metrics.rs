//! Prometheus metric points and the exposition listener.
//!
//! The registry lives inside the injected [`Metrics`] bundle constructed once
//! at startup, never in a process-global. Metric points are part of the
//! framework contract: the response cache, the requester and the background
//! executor all record through this module. Exposition runs on its own
//! listener so scrapes never contend with the client-facing front door.

use std::convert::Infallible;
use std::sync::Arc;

use http::{Method, StatusCode, header};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;

use crate::shutdown::Shutdown;

/// All metric points recorded by the framework.
pub struct Metrics {
    registry: Registry,

    /// Cache writes, per feed.
    pub cache_data_set_count: IntCounterVec,
    /// TTL applied to the latest cache write, per feed, in milliseconds.
    pub cache_data_max_age: IntGaugeVec,
    /// Seconds between now and the provider-indicated time of the latest
    /// write; zero when the provider did not indicate a time.
    pub cache_data_staleness_seconds: GaugeVec,

    /// Size of the subscription set observed at the start of a background
    /// execution.
    pub bg_execute_subscription_set_count: IntGaugeVec,
    /// Background executions started.
    pub bg_execute_total: IntCounterVec,
    /// Background executions that ended in an error or timed out.
    pub bg_execute_errors: IntCounterVec,
    /// Wall time of one background execution.
    pub bg_execute_duration_seconds: HistogramVec,
    /// Whether the cache warmer for an endpoint had anything to do on its
    /// last tick (1) or found an empty subscription set (0).
    pub cache_warmer: IntGaugeVec,

    /// Requests currently queued in the requester.
    pub http_request_queue_depth: IntGauge,
    /// Requests evicted from a full requester queue.
    pub http_request_queue_overflow_count: IntCounter,
    /// Foreground REST requests that gave up waiting for rate-limit
    /// admission.
    pub rest_transport_rate_limit_timeouts: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let cache_data_set_count = IntCounterVec::new(
            Opts::new("cache_data_set_count", "Cache writes per feed"),
            &["endpoint", "transport", "feed_id"],
        )?;
        let cache_data_max_age = IntGaugeVec::new(
            Opts::new(
                "cache_data_max_age",
                "TTL in ms applied to the latest cache write per feed",
            ),
            &["endpoint", "transport", "feed_id"],
        )?;
        let cache_data_staleness_seconds = GaugeVec::new(
            Opts::new(
                "cache_data_staleness_seconds",
                "Seconds between write time and provider-indicated time",
            ),
            &["endpoint", "transport", "feed_id"],
        )?;
        let bg_execute_subscription_set_count = IntGaugeVec::new(
            Opts::new(
                "bg_execute_subscription_set_count",
                "Subscription set size at background execution start",
            ),
            &["endpoint", "transport"],
        )?;
        let bg_execute_total = IntCounterVec::new(
            Opts::new("bg_execute_total", "Background executions started"),
            &["endpoint", "transport"],
        )?;
        let bg_execute_errors = IntCounterVec::new(
            Opts::new("bg_execute_errors", "Failed background executions"),
            &["endpoint", "transport"],
        )?;
        let bg_execute_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "bg_execute_duration_seconds",
                "Wall time of one background execution",
            ),
            &["endpoint", "transport"],
        )?;
        let cache_warmer = IntGaugeVec::new(
            Opts::new("cache_warmer", "Whether the endpoint cache warmer is active"),
            &["endpoint"],
        )?;
        let http_request_queue_depth = IntGauge::new(
            "http_request_queue_depth",
            "Requests currently queued in the requester",
        )?;
        let http_request_queue_overflow_count = IntCounter::new(
            "http_request_queue_overflow_count",
            "Requests evicted from a full requester queue",
        )?;
        let rest_transport_rate_limit_timeouts = IntCounterVec::new(
            Opts::new(
                "rest_transport_rate_limit_timeouts",
                "Foreground requests that exhausted rate-limit admission retries",
            ),
            &["endpoint"],
        )?;

        registry.register(Box::new(cache_data_set_count.clone()))?;
        registry.register(Box::new(cache_data_max_age.clone()))?;
        registry.register(Box::new(cache_data_staleness_seconds.clone()))?;
        registry.register(Box::new(bg_execute_subscription_set_count.clone()))?;
        registry.register(Box::new(bg_execute_total.clone()))?;
        registry.register(Box::new(bg_execute_errors.clone()))?;
        registry.register(Box::new(bg_execute_duration_seconds.clone()))?;
        registry.register(Box::new(cache_warmer.clone()))?;
        registry.register(Box::new(http_request_queue_depth.clone()))?;
        registry.register(Box::new(http_request_queue_overflow_count.clone()))?;
        registry.register(Box::new(rest_transport_rate_limit_timeouts.clone()))?;

        Ok(Self {
            registry,
            cache_data_set_count,
            cache_data_max_age,
            cache_data_staleness_seconds,
            bg_execute_subscription_set_count,
            bg_execute_total,
            bg_execute_errors,
            bg_execute_duration_seconds,
            cache_warmer,
            http_request_queue_depth,
            http_request_queue_overflow_count,
            rest_transport_rate_limit_timeouts,
        })
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn gather_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

/// Serves `GET {path}` with the text exposition until shutdown.
///
/// `path` is `/metrics`, or `{BASE_URL}/metrics` when the deployment routes
/// scrapes through the same prefix as the front door.
pub async fn serve_metrics(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    path: String,
    shutdown: Shutdown,
) {
    let path: Arc<str> = path.into();
    tracing::info!(addr = ?listener.local_addr().ok(), path = %path, "metrics listener started");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, _addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "metrics accept failed");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();
        let path = path.clone();

        tokio::spawn(async move {
            let svc = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                let metrics = metrics.clone();
                let path = path.clone();
                async move {
                    let response = if req.method() == Method::GET && req.uri().path() == &*path {
                        hyper::Response::builder()
                            .status(StatusCode::OK)
                            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
                            .body(Full::new(Bytes::from(metrics.gather_text())))
                            .unwrap()
                    } else {
                        hyper::Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Full::new(Bytes::new()))
                            .unwrap()
                    };
                    Ok::<_, Infallible>(response)
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                tracing::debug!(error = %e, "metrics connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_gathers_all_points() {
        let metrics = Metrics::new().unwrap();
        metrics
            .cache_data_set_count
            .with_label_values(&["price", "rest", "{}"])
            .inc();
        metrics.http_request_queue_depth.set(3);
        metrics
            .cache_warmer
            .with_label_values(&["price"])
            .set(1);

        let text = metrics.gather_text();
        assert!(text.contains("cache_data_set_count"));
        assert!(text.contains("http_request_queue_depth 3"));
        assert!(text.contains("cache_warmer"));
    }

    #[test]
    fn staleness_gauge_accepts_fractional_seconds() {
        let metrics = Metrics::new().unwrap();
        metrics
            .cache_data_staleness_seconds
            .with_label_values(&["price", "websocket", "{}"])
            .set(0.25);
        assert!(metrics.gather_text().contains("cache_data_staleness_seconds"));
    }
}
