//! Background executor.
//!
//! One task per (endpoint, transport) pair, spawned at startup in the writer
//! modes. Each loop sleeps for the rate limiter's interval (never less than
//! the transport's own tick floor), runs one background execution under the
//! global tick timeout, records metrics, and keeps going. A failing cycle is
//! logged and counted, never fatal; stopping is always and only a shutdown.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::config::Settings;
use crate::metrics::Metrics;
use crate::rate_limit::RateLimiter;
use crate::shutdown::Shutdown;
use crate::transport::Transport;

/// Spawns the background loop for one endpoint's transport.
pub fn spawn_loop(
    endpoint_name: String,
    transport: Arc<dyn Transport>,
    settings: Arc<Settings>,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let transport_name = transport.name();
        let tick_floor = transport.tick_floor_ms(&settings);
        let tick_timeout = settings.subscriptions.background_execute_timeout;
        tracing::info!(
            endpoint = %endpoint_name,
            transport = transport_name,
            "background loop started"
        );

        loop {
            let interval = rate_limiter
                .ms_until_next_execution(&endpoint_name)
                .max(tick_floor);
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(Duration::from_millis(interval)) => {}
            }
            if shutdown.is_triggered() {
                break;
            }

            rate_limiter.record_execution();
            let labels = [endpoint_name.as_str(), transport_name];
            metrics.bg_execute_total.with_label_values(&labels).inc();

            let started = Instant::now();
            let outcome = tokio::time::timeout(tick_timeout, transport.background_execute()).await;
            metrics
                .bg_execute_duration_seconds
                .with_label_values(&labels)
                .observe(started.elapsed().as_secs_f64());

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // The subscription driver already counted this error and
                    // armed its backoff window.
                    tracing::warn!(
                        endpoint = %endpoint_name,
                        transport = transport_name,
                        error = %e,
                        "background execution failed"
                    );
                }
                Err(_) => {
                    metrics.bg_execute_errors.with_label_values(&labels).inc();
                    tracing::warn!(
                        endpoint = %endpoint_name,
                        transport = transport_name,
                        timeout_ms = tick_timeout.as_millis() as u64,
                        "background execution abandoned after timeout"
                    );
                }
            }
        }

        tracing::info!(
            endpoint = %endpoint_name,
            transport = transport_name,
            "background loop stopped"
        );
    })
}
