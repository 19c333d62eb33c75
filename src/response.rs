//! Adapter response types and the wire shape returned to clients.
//!
//! A provider value always reaches the client as an [`AdapterResponse`]:
//! either a success carrying `data` and `result`, or a provider error carrying
//! `errorMessage`. Both carry [`ResponseTimestamps`] describing when the value
//! was requested (or when the stream producing it was established) and when it
//! was received from the provider.
//!
//! Transports produce [`PartialResponse`] values from user parsing callbacks;
//! the framework stamps status codes and timestamps before anything is
//! written to the cache.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::params::RequestParams;

/// Milliseconds since the Unix epoch, as stamped into response timestamps.
pub fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Provider timing metadata attached to every response.
///
/// Exactly one of `provider_data_requested_unix_ms` (synchronous transports)
/// or `provider_data_stream_established_unix_ms` (streaming transports) is
/// set by the framework. `provider_indicated_time_unix_ms` is optional and
/// comes from the provider payload itself when the user parser surfaces it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseTimestamps {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_data_requested_unix_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_data_stream_established_unix_ms: Option<u64>,
    pub provider_data_received_unix_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_indicated_time_unix_ms: Option<u64>,
}

impl ResponseTimestamps {
    /// Timestamps for a synchronous request/response cycle.
    pub fn synchronous(requested_unix_ms: u64) -> Self {
        Self {
            provider_data_requested_unix_ms: Some(requested_unix_ms),
            provider_data_received_unix_ms: unix_ms_now(),
            ..Default::default()
        }
    }

    /// Timestamps for a value delivered over an established stream.
    pub fn streaming(stream_established_unix_ms: u64) -> Self {
        Self {
            provider_data_stream_established_unix_ms: Some(stream_established_unix_ms),
            provider_data_received_unix_ms: unix_ms_now(),
            ..Default::default()
        }
    }
}

/// Metric metadata attached to successful responses when metrics are enabled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaMetrics {
    pub feed_id: String,
}

/// Response metadata block.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetaMetrics>,
}

impl ResponseMeta {
    fn is_empty(&self) -> bool {
        self.adapter_name.is_none() && self.metrics.is_none()
    }
}

/// A successful provider response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessResponse {
    pub status_code: u16,
    pub data: Value,
    pub result: Value,
    #[serde(default)]
    pub timestamps: ResponseTimestamps,
    #[serde(default, skip_serializing_if = "meta_is_empty")]
    pub meta: Option<ResponseMeta>,
}

fn meta_is_empty(meta: &Option<ResponseMeta>) -> bool {
    meta.as_ref().map(|m| m.is_empty()).unwrap_or(true)
}

/// A provider or framework error response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub status_code: u16,
    pub error_message: String,
    #[serde(default)]
    pub timestamps: ResponseTimestamps,
}

/// The value cached and returned for every adapter request.
///
/// Serialized untagged: the presence of `errorMessage` versus `data`/`result`
/// distinguishes the variants on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdapterResponse {
    Error(ErrorResponse),
    Success(SuccessResponse),
}

impl AdapterResponse {
    /// Builds a plain success response with status 200.
    pub fn success(data: Value, result: Value, timestamps: ResponseTimestamps) -> Self {
        Self::Success(SuccessResponse {
            status_code: 200,
            data,
            result,
            timestamps,
            meta: None,
        })
    }

    /// Builds an error response.
    pub fn error(status_code: u16, message: impl Into<String>) -> Self {
        Self::Error(ErrorResponse {
            status_code,
            error_message: message.into(),
            timestamps: ResponseTimestamps::default(),
        })
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Success(s) => s.status_code,
            Self::Error(e) => e.status_code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn timestamps(&self) -> &ResponseTimestamps {
        match self {
            Self::Success(s) => &s.timestamps,
            Self::Error(e) => &e.timestamps,
        }
    }

    pub fn timestamps_mut(&mut self) -> &mut ResponseTimestamps {
        match self {
            Self::Success(s) => &mut s.timestamps,
            Self::Error(e) => &mut e.timestamps,
        }
    }

    /// Attaches metric metadata to a success response. Errors are unchanged.
    pub fn with_feed_id(mut self, adapter_name: &str, feed_id: &str) -> Self {
        if let Self::Success(s) = &mut self {
            let meta = s.meta.get_or_insert_with(ResponseMeta::default);
            meta.adapter_name = Some(adapter_name.to_string());
            meta.metrics = Some(MetaMetrics {
                feed_id: feed_id.to_string(),
            });
        }
        self
    }
}

/// What a user parsing callback returns for one parameter tuple, before the
/// framework stamps status and timestamps.
#[derive(Clone, Debug, PartialEq)]
pub enum PartialResponse {
    Success {
        data: Value,
        result: Value,
        /// Timestamp the provider itself attached to the value, if any.
        provider_indicated_time_unix_ms: Option<u64>,
    },
    Error {
        status_code: u16,
        message: String,
    },
}

impl PartialResponse {
    pub fn success(data: Value, result: Value) -> Self {
        Self::Success {
            data,
            result,
            provider_indicated_time_unix_ms: None,
        }
    }

    pub fn error(status_code: u16, message: impl Into<String>) -> Self {
        Self::Error {
            status_code,
            message: message.into(),
        }
    }

    /// Completes the partial response into a cacheable [`AdapterResponse`].
    pub fn into_response(self, mut timestamps: ResponseTimestamps) -> AdapterResponse {
        match self {
            Self::Success {
                data,
                result,
                provider_indicated_time_unix_ms,
            } => {
                timestamps.provider_indicated_time_unix_ms = provider_indicated_time_unix_ms;
                AdapterResponse::Success(SuccessResponse {
                    status_code: 200,
                    data,
                    result,
                    timestamps,
                    meta: None,
                })
            }
            Self::Error {
                status_code,
                message,
            } => AdapterResponse::Error(ErrorResponse {
                status_code,
                error_message: message,
                timestamps,
            }),
        }
    }
}

/// One parsed provider value for one parameter tuple, as produced by user
/// parsing callbacks in background transports.
#[derive(Clone, Debug)]
pub struct ProviderResult {
    pub params: RequestParams,
    pub response: PartialResponse,
}

impl ProviderResult {
    pub fn new(params: RequestParams, response: PartialResponse) -> Self {
        Self { params, response }
    }
}
