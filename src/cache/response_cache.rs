//! Response cache facade.
//!
//! Wraps the raw key/value cache with everything a transport needs to persist
//! provider values: cache key computation, status stamping, feed-id metadata,
//! censoring of sensitive values, a single batched write per cycle, and the
//! per-entry cache metrics.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::cache::Cache;
use crate::censor::CensorList;
use crate::error::CacheError;
use crate::metrics::Metrics;
use crate::params::{RequestParams, cache_key};
use crate::response::{AdapterResponse, unix_ms_now};

/// Error entry written when a response cannot be censored.
const CENSOR_FAILURE_MESSAGE: &str = "Response could not be censored due to an error";

/// Shared facade over the raw cache.
pub struct ResponseCache {
    cache: Arc<dyn Cache>,
    metrics: Arc<Metrics>,
    censor: CensorList,
    adapter_name: String,
    prefix: Option<String>,
    max_age: Duration,
    metrics_enabled: bool,
}

impl ResponseCache {
    pub fn new(
        cache: Arc<dyn Cache>,
        metrics: Arc<Metrics>,
        censor: CensorList,
        adapter_name: String,
        prefix: Option<String>,
        max_age: Duration,
        metrics_enabled: bool,
    ) -> Self {
        Self {
            cache,
            metrics,
            censor,
            adapter_name,
            prefix,
            max_age,
            metrics_enabled,
        }
    }

    /// The raw cache, for in-flight markers and polling.
    pub fn raw(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Cache key for one request against this adapter.
    pub fn key(&self, endpoint: &str, transport: &str, params: &RequestParams) -> String {
        cache_key(
            self.prefix.as_deref(),
            &self.adapter_name,
            endpoint,
            transport,
            params,
        )
    }

    /// Reads a previously written response by key.
    pub async fn read(&self, cache_key: &str) -> Result<Option<AdapterResponse>, CacheError> {
        let Some(value) = self.cache.get(cache_key).await? else {
            return Ok(None);
        };
        match serde_json::from_value::<AdapterResponse>(value) {
            Ok(response) => Ok(Some(response)),
            Err(e) => {
                tracing::warn!(key = %cache_key, error = %e, "unreadable cache entry, treating as miss");
                Ok(None)
            }
        }
    }

    /// Writes one batch of responses for an endpoint/transport pair.
    ///
    /// Every response is stamped with its feed id (when metrics are on),
    /// censored, and persisted in a single `set_many` with the configured
    /// max age. Cache metrics are recorded per entry.
    pub async fn write(
        &self,
        endpoint: &str,
        transport: &str,
        input_fields: &[String],
        results: Vec<(RequestParams, AdapterResponse)>,
    ) -> Result<(), CacheError> {
        if results.is_empty() {
            return Ok(());
        }

        let now_ms = unix_ms_now();
        let max_age_ms = self.max_age.as_millis() as i64;
        let mut entries = Vec::with_capacity(results.len());

        for (params, response) in results {
            let key = self.key(endpoint, transport, &params);
            let feed_id = params.feed_id(input_fields);

            let response = if self.metrics_enabled {
                response.with_feed_id(&self.adapter_name, &feed_id)
            } else {
                response
            };

            let staleness_seconds = response
                .timestamps()
                .provider_indicated_time_unix_ms
                .map(|t| (now_ms.saturating_sub(t)) as f64 / 1000.0)
                .unwrap_or(0.0);

            let value = self.censored_value(&response);

            if self.metrics_enabled {
                let labels = [endpoint, transport, feed_id.as_str()];
                self.metrics
                    .cache_data_set_count
                    .with_label_values(&labels)
                    .inc();
                self.metrics
                    .cache_data_max_age
                    .with_label_values(&labels)
                    .set(max_age_ms);
                self.metrics
                    .cache_data_staleness_seconds
                    .with_label_values(&labels)
                    .set(staleness_seconds);
            }

            entries.push((key, value));
        }

        self.cache.set_many(entries, self.max_age).await
    }

    /// Serializes and censors a response, falling back to a 502 error entry
    /// when the response cannot be represented safely.
    fn censored_value(&self, response: &AdapterResponse) -> Value {
        match serde_json::to_value(response) {
            Ok(mut value) => {
                self.censor.censor_value(&mut value);
                value
            }
            Err(e) => {
                tracing::error!(error = %e, "response censoring failed");
                serde_json::to_value(AdapterResponse::error(502, CENSOR_FAILURE_MESSAGE))
                    .unwrap_or(Value::Null)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;
    use crate::censor::CensorItem;
    use crate::response::ResponseTimestamps;
    use serde_json::json;

    fn facade(censor: CensorList, metrics_enabled: bool) -> ResponseCache {
        ResponseCache::new(
            Arc::new(LocalCache::new(100)),
            Arc::new(Metrics::new().unwrap()),
            censor,
            "TEST".to_string(),
            None,
            Duration::from_secs(90),
            metrics_enabled,
        )
    }

    fn params() -> RequestParams {
        let mut p = RequestParams::new();
        p.insert("base", json!("ETH"));
        p
    }

    #[tokio::test]
    async fn write_then_read_roundtrips_by_key() {
        let cache = facade(CensorList::default(), false);
        let response = AdapterResponse::success(
            json!({"price": 10}),
            json!(10),
            ResponseTimestamps::synchronous(unix_ms_now()),
        );

        cache
            .write("price", "rest", &[], vec![(params(), response.clone())])
            .await
            .unwrap();

        let key = cache.key("price", "rest", &params());
        assert_eq!(key, r#"TEST-price-rest-{"base":"ETH"}"#);
        let read = cache.read(&key).await.unwrap().unwrap();
        assert_eq!(read.status_code(), 200);
        assert!(read.is_success());
    }

    #[tokio::test]
    async fn feed_id_meta_is_attached_when_metrics_enabled() {
        let cache = facade(CensorList::default(), true);
        let response =
            AdapterResponse::success(json!(1), json!(1), ResponseTimestamps::default());

        cache
            .write(
                "price",
                "rest",
                &["base".to_string()],
                vec![(params(), response)],
            )
            .await
            .unwrap();

        let key = cache.key("price", "rest", &params());
        match cache.read(&key).await.unwrap().unwrap() {
            AdapterResponse::Success(s) => {
                let meta = s.meta.unwrap();
                assert_eq!(meta.metrics.unwrap().feed_id, r#"{"base":"ETH"}"#);
                assert_eq!(meta.adapter_name.as_deref(), Some("TEST"));
            }
            _ => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn sensitive_values_are_censored_before_caching() {
        let censor = CensorList::new(vec![CensorItem::new("API_KEY", "hunter2")]);
        let cache = facade(censor, false);
        let response = AdapterResponse::success(
            json!({"echo": "key=hunter2"}),
            json!("ok"),
            ResponseTimestamps::default(),
        );

        cache
            .write("price", "rest", &[], vec![(params(), response)])
            .await
            .unwrap();

        let key = cache.key("price", "rest", &params());
        match cache.read(&key).await.unwrap().unwrap() {
            AdapterResponse::Success(s) => {
                assert_eq!(s.data["echo"], "key=[API_KEY REDACTED]");
            }
            _ => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn error_responses_pass_their_status_through() {
        let cache = facade(CensorList::default(), false);
        let response = AdapterResponse::error(502, "Provider returned 500: boom");

        cache
            .write("price", "batch", &[], vec![(params(), response)])
            .await
            .unwrap();

        let key = cache.key("price", "batch", &params());
        let read = cache.read(&key).await.unwrap().unwrap();
        assert_eq!(read.status_code(), 502);
    }
}
