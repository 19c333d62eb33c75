//! Error types for the adapter framework.
//!
//! Every failure that can reach a client is an [`AdapterError`] variant with
//! a fixed HTTP status mapping. Configuration and cache failures have their
//! own enums and fold into the adapter error through `#[from]` conversions.

use crate::response::AdapterResponse;

/// Top-level error type for the framework.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Input validation failure on the inbound request. Maps to 400.
    #[error("Invalid input: {0}")]
    Input(String),

    /// Request body over `MAX_PAYLOAD_SIZE_LIMIT`. Maps to 413.
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    /// Admission denied after exhausting rate-limit retries. Maps to 429.
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// Upstream or internal timeout. Maps to 504.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Upstream unreachable at the connection level. Maps to 502 with a
    /// provider status code of 0.
    #[error("Provider connection failed: {0}")]
    Connection(String),

    /// The provider answered with a non-2xx status. Maps to 502 with the
    /// upstream status echoed.
    #[error("Provider returned {provider_status_code}: {message}")]
    DataProvider {
        provider_status_code: u16,
        message: String,
    },

    /// A user-supplied callback failed. Maps to 500.
    #[error("Adapter handler error: {0}")]
    Custom(String),

    /// Cache backend failure. Maps to 500.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Configuration failure; fatal at startup.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Adapter definition failure; fatal at startup.
    #[error("Adapter setup error: {0}")]
    Setup(String),

    /// Internal invariant violation. Maps to 500.
    #[error("{0}")]
    Internal(String),
}

impl AdapterError {
    /// HTTP status the error maps to on the client-facing surface.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Input(_) => 400,
            Self::PayloadTooLarge(_) => 413,
            Self::RateLimit(_) => 429,
            Self::Timeout(_) => 504,
            Self::Connection(_) | Self::DataProvider { .. } => 502,
            Self::Custom(_)
            | Self::Cache(_)
            | Self::Config(_)
            | Self::Setup(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Upstream status code carried by the error, when meaningful.
    pub fn provider_status_code(&self) -> Option<u16> {
        match self {
            Self::Connection(_) => Some(0),
            Self::DataProvider {
                provider_status_code,
                ..
            } => Some(*provider_status_code),
            _ => None,
        }
    }

    /// Shapes the error as the cacheable/client-facing response union.
    pub fn to_response(&self) -> AdapterResponse {
        AdapterResponse::error(self.status_code(), self.to_string())
    }

    /// True for errors that should terminate startup rather than be served.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Setup(_) | Self::Cache(CacheError::QuorumNotReached { .. })
        )
    }
}

/// Cache and coordination backend errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Backend(String),

    #[error("failed to encode cache entry: {0}")]
    Encode(#[from] serde_json::Error),

    /// The writer lock could not be acquired within the retry budget.
    #[error("quorum not reached: another writer holds the lock for {key}")]
    QuorumNotReached { key: String },
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Configuration errors. All are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("{0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(AdapterError::Input("x".into()).status_code(), 400);
        assert_eq!(AdapterError::PayloadTooLarge("x".into()).status_code(), 413);
        assert_eq!(AdapterError::RateLimit("x".into()).status_code(), 429);
        assert_eq!(AdapterError::Timeout("x".into()).status_code(), 504);
        assert_eq!(AdapterError::Connection("x".into()).status_code(), 502);
        assert_eq!(
            AdapterError::DataProvider {
                provider_status_code: 500,
                message: "x".into()
            }
            .status_code(),
            502
        );
        assert_eq!(AdapterError::Custom("x".into()).status_code(), 500);
    }

    #[test]
    fn connection_errors_carry_zero_provider_status() {
        assert_eq!(
            AdapterError::Connection("refused".into()).provider_status_code(),
            Some(0)
        );
        assert_eq!(
            AdapterError::DataProvider {
                provider_status_code: 503,
                message: "overloaded".into()
            }
            .provider_status_code(),
            Some(503)
        );
        assert_eq!(AdapterError::Input("x".into()).provider_status_code(), None);
    }

    #[test]
    fn quorum_error_is_fatal() {
        let err = AdapterError::Cache(CacheError::QuorumNotReached {
            key: "TEST-lock".into(),
        });
        assert!(err.is_fatal());
        assert!(err.to_string().contains("quorum not reached"));
    }
}
