//! HTTP front door.
//!
//! The client-facing surface is intentionally small: `POST {BASE_URL}` for
//! adapter requests and `GET {BASE_URL}/health` for liveness. Each accepted
//! connection is served on its own task. The request path is cache-first:
//! a live cached response returns immediately; a miss either executes the
//! REST transport in the foreground or registers the parameters for the
//! background loops and answers 504 so the client retries into a warm cache.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, StatusCode, header};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use crate::adapter::AdapterRuntime;
use crate::cache::poll_for_entry;
use crate::error::AdapterError;
use crate::params::RequestParams;
use crate::response::AdapterResponse;
use crate::shutdown::Shutdown;
use crate::transport::AdapterRequest;

/// The client request envelope.
#[derive(Debug, Default, Deserialize)]
struct RequestEnvelope {
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    data: Value,
}

/// Serves the front door until shutdown triggers.
pub async fn serve(listener: TcpListener, runtime: Arc<AdapterRuntime>, shutdown: Shutdown) {
    tracing::info!(addr = ?listener.local_addr().ok(), "front door listening");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, _addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let runtime = runtime.clone();

        // One task per connection, as many requests as keep-alive brings.
        tokio::spawn(async move {
            let svc = service_fn(move |req: hyper::Request<Incoming>| {
                let runtime = runtime.clone();
                async move { Ok::<_, Infallible>(handle(runtime, req).await) }
            });

            let mut http = http1::Builder::new();
            http.keep_alive(true);
            if let Err(e) = http.serve_connection(io, svc).await {
                tracing::debug!(error = %e, "connection error");
            }
        });
    }

    tracing::info!("front door stopped");
}

/// Routes one request. Exposed to the TLS listener as well.
pub(crate) async fn handle(
    runtime: Arc<AdapterRuntime>,
    req: hyper::Request<Incoming>,
) -> hyper::Response<Full<Bytes>> {
    let base = runtime.settings.server.base_url.clone();
    let main_path = if base == "/" { "/".to_string() } else { base.clone() };
    let health_path = if base == "/" {
        "/health".to_string()
    } else {
        format!("{base}/health")
    };

    let path = req.uri().path().to_string();
    match (req.method().clone(), path.as_str()) {
        (Method::GET, p) if p == health_path => json_response(
            StatusCode::OK,
            &json!({"message": "OK", "version": env!("CARGO_PKG_VERSION")}),
        ),
        (Method::POST, p) if p == main_path => match handle_adapter_request(&runtime, req).await {
            Ok(response) => adapter_response(&response),
            Err(error) => error_response(&error),
        },
        _ => json_response(
            StatusCode::NOT_FOUND,
            &json!({"statusCode": 404, "errorMessage": "Not found"}),
        ),
    }
}

async fn handle_adapter_request(
    runtime: &Arc<AdapterRuntime>,
    req: hyper::Request<Incoming>,
) -> Result<AdapterResponse, AdapterError> {
    if !runtime.settings.server.mode.is_reader() {
        return Err(AdapterError::Input(
            "adapter is running in writer mode and serves no client requests".into(),
        ));
    }

    let limit = runtime.settings.server.max_payload_size_limit;
    let body = Limited::new(req.into_body(), limit)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                AdapterError::PayloadTooLarge(format!("request body exceeds {limit} bytes"))
            } else {
                AdapterError::Input(format!("failed to read request body: {e}"))
            }
        })?
        .to_bytes();

    let envelope: RequestEnvelope = if body.is_empty() {
        RequestEnvelope::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AdapterError::Input(e.to_string()))?
    };

    let endpoint = runtime.resolve_endpoint(envelope.endpoint.as_deref())?;
    let params = extract_params(&runtime.name, envelope.data)?;
    let cache_key = runtime
        .response_cache
        .key(&endpoint.name, endpoint.transport.name(), &params);

    if let Some(cached) = runtime.response_cache.read(&cache_key).await? {
        return Ok(cached);
    }

    let request = AdapterRequest {
        endpoint_name: endpoint.name.clone(),
        params,
        cache_key: cache_key.clone(),
    };

    if let Some(response) = endpoint.transport.foreground_execute(&request).await? {
        return Ok(response);
    }

    // Subscription transports (and coalesced REST requests) land here: make
    // sure the background loops know about these parameters, then wait for
    // the cache to fill.
    endpoint.transport.register_request(&request).await?;

    let cache_settings = &runtime.settings.cache;
    let polled = poll_for_entry(
        runtime.response_cache.raw().as_ref(),
        &cache_key,
        cache_settings.polling_max_retries,
        cache_settings.polling_sleep,
    )
    .await?;

    match polled {
        Some(value) => serde_json::from_value(value)
            .map_err(|e| AdapterError::Internal(format!("unreadable cache entry: {e}"))),
        None => Err(AdapterError::Timeout(
            "no cached value matched the request before the polling deadline; \
             the value is being warmed up, retry shortly"
                .into(),
        )),
    }
}

/// Lifts the request `data` into parameters, applying symbol overrides
/// before anything is canonicalized so cache keys see the rewritten value.
fn extract_params(adapter_name: &str, data: Value) -> Result<RequestParams, AdapterError> {
    let Value::Object(mut map) = data else {
        return Err(AdapterError::Input("request data must be an object".into()));
    };

    let overrides = map.remove("overrides");
    let mut params = RequestParams(map.into_iter().collect());

    if let Some(overrides) = overrides {
        let by_adapter = overrides
            .get(adapter_name.to_lowercase().as_str())
            .or_else(|| overrides.get(adapter_name))
            .and_then(Value::as_object);
        if let Some(symbol_map) = by_adapter {
            if let Some(Value::String(base)) = params.get("base").cloned() {
                if let Some(replacement) = symbol_map.get(&base) {
                    params.insert("base", replacement.clone());
                }
            }
        }
    }

    Ok(params)
}

fn adapter_response(response: &AdapterResponse) -> hyper::Response<Full<Bytes>> {
    let status = StatusCode::from_u16(response.status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match serde_json::to_vec(response) {
        Ok(body) => hyper::Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap(),
        Err(e) => error_response(&AdapterError::Internal(format!(
            "response serialization failed: {e}"
        ))),
    }
}

fn error_response(error: &AdapterError) -> hyper::Response<Full<Bytes>> {
    let status = error.status_code();
    let mut body = json!({
        "statusCode": status,
        "errorMessage": error.to_string(),
    });
    if let Some(provider_status) = error.provider_status_code() {
        body["providerStatusCode"] = json!(provider_status);
    }
    json_response(
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        &body,
    )
}

fn json_response(status: StatusCode, body: &Value) -> hyper::Response<Full<Bytes>> {
    hyper::Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_are_lifted_from_data_without_overrides_key() {
        let params = extract_params(
            "TEST",
            json!({"base": "ETH", "quote": "USD", "overrides": {"test": {"ETH": "WETH"}}}),
        )
        .unwrap();
        assert!(params.get("overrides").is_none());
        assert_eq!(params.get("base"), Some(&json!("WETH")));
        assert_eq!(params.get("quote"), Some(&json!("USD")));
    }

    #[test]
    fn overrides_for_other_adapters_are_ignored() {
        let params = extract_params(
            "TEST",
            json!({"base": "ETH", "overrides": {"other": {"ETH": "WETH"}}}),
        )
        .unwrap();
        assert_eq!(params.get("base"), Some(&json!("ETH")));
    }

    #[test]
    fn non_object_data_is_an_input_error() {
        let err = extract_params("TEST", json!([1, 2, 3])).unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn envelope_tolerates_missing_endpoint() {
        let envelope: RequestEnvelope =
            serde_json::from_str(r#"{"data": {"base": "ETH"}}"#).unwrap();
        assert!(envelope.endpoint.is_none());
        assert_eq!(envelope.data["base"], "ETH");
    }
}
