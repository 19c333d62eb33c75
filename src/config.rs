//! Environment-driven configuration.
//!
//! All recognized options are read once at startup into a typed [`Settings`]
//! tree. Each section has its own `from_env` constructor; invalid values are
//! fatal [`ConfigError`]s naming the offending variable. Nothing in the
//! framework reads the process environment after startup.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Process role: which halves of the adapter this replica runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EaMode {
    Reader,
    Writer,
    #[default]
    ReaderWriter,
}

impl EaMode {
    /// Whether this replica serves the client-facing front door.
    pub fn is_reader(self) -> bool {
        matches!(self, Self::Reader | Self::ReaderWriter)
    }

    /// Whether this replica runs background loops and owns the write path.
    pub fn is_writer(self) -> bool {
        matches!(self, Self::Writer | Self::ReaderWriter)
    }
}

impl FromStr for EaMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reader" => Ok(Self::Reader),
            "writer" => Ok(Self::Writer),
            "reader-writer" => Ok(Self::ReaderWriter),
            other => Err(format!(
                "unknown mode {other:?}, expected reader, writer or reader-writer"
            )),
        }
    }
}

impl fmt::Display for EaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reader => write!(f, "reader"),
            Self::Writer => write!(f, "writer"),
            Self::ReaderWriter => write!(f, "reader-writer"),
        }
    }
}

/// Cache backend selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CacheType {
    #[default]
    Local,
    Remote,
}

impl FromStr for CacheType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(format!("unknown cache type {other:?}, expected local or remote")),
        }
    }
}

/// Front-door bind address, URL prefix and TLS material.
#[derive(Clone, Debug)]
pub struct ServerSettings {
    pub mode: EaMode,
    pub host: String,
    pub port: u16,
    pub base_url: String,
    pub max_payload_size_limit: usize,
    pub tls_enabled: bool,
    pub mtls_enabled: bool,
    /// Paths to PEM files on disk.
    pub tls_private_key: Option<String>,
    pub tls_public_key: Option<String>,
    pub tls_ca: Option<String>,
    pub tls_passphrase: Option<String>,
}

impl ServerSettings {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            mode: parse_env("EA_MODE", EaMode::default())?,
            host: optional_env("EA_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_env("EA_PORT", 8080)?,
            base_url: normalize_base_url(optional_env("BASE_URL").as_deref().unwrap_or("/")),
            max_payload_size_limit: parse_env("MAX_PAYLOAD_SIZE_LIMIT", 1_048_576)?,
            tls_enabled: parse_env("TLS_ENABLED", false)?,
            mtls_enabled: parse_env("MTLS_ENABLED", false)?,
            tls_private_key: optional_env("TLS_PRIVATE_KEY"),
            tls_public_key: optional_env("TLS_PUBLIC_KEY"),
            tls_ca: optional_env("TLS_CA"),
            tls_passphrase: optional_env("TLS_PASSPHRASE"),
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tls_enabled && self.mtls_enabled {
            return Err(ConfigError::Invalid(
                "TLS_ENABLED and MTLS_ENABLED are mutually exclusive".to_string(),
            ));
        }
        if self.tls_enabled && (self.tls_private_key.is_none() || self.tls_public_key.is_none()) {
            return Err(ConfigError::Invalid(
                "TLS_ENABLED requires TLS_PRIVATE_KEY and TLS_PUBLIC_KEY".to_string(),
            ));
        }
        if self.mtls_enabled
            && (self.tls_private_key.is_none()
                || self.tls_public_key.is_none()
                || self.tls_ca.is_none())
        {
            return Err(ConfigError::Invalid(
                "MTLS_ENABLED requires TLS_PRIVATE_KEY, TLS_PUBLIC_KEY and TLS_CA".to_string(),
            ));
        }
        Ok(())
    }

    /// True when the front door terminates TLS in either mode.
    pub fn tls_active(&self) -> bool {
        self.tls_enabled || self.mtls_enabled
    }
}

/// Cache backend, namespace, lock and foreground polling knobs.
#[derive(Clone, Debug)]
pub struct CacheSettings {
    pub cache_type: CacheType,
    pub max_items: usize,
    pub max_age: Duration,
    pub prefix: Option<String>,
    pub redis_url: String,
    pub lock_duration: Duration,
    pub lock_retries: u32,
    pub polling_sleep: Duration,
    pub polling_max_retries: u32,
}

impl CacheSettings {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            cache_type: parse_env("CACHE_TYPE", CacheType::default())?,
            max_items: parse_env("CACHE_MAX_ITEMS", 10_000)?,
            max_age: Duration::from_millis(parse_env("CACHE_MAX_AGE", 90_000u64)?),
            prefix: optional_env("CACHE_PREFIX"),
            redis_url: optional_env("CACHE_REDIS_URL")
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            lock_duration: Duration::from_millis(parse_env("CACHE_LOCK_DURATION", 10_000u64)?),
            lock_retries: parse_env("CACHE_LOCK_RETRIES", 10)?,
            polling_sleep: Duration::from_millis(parse_env("CACHE_POLLING_SLEEP_MS", 200u64)?),
            polling_max_retries: parse_env("CACHE_POLLING_MAX_RETRIES", 10)?,
        })
    }
}

/// Subscription TTLs, background cadence and backoff bounds.
#[derive(Clone, Debug)]
pub struct SubscriptionSettings {
    pub warmup_subscription_ttl: Duration,
    pub ws_subscription_ttl: Duration,
    pub ws_subscription_unresponsive_ttl: Duration,
    pub ws_heartbeat_interval: Duration,
    pub ws_connection_open_timeout: Duration,
    pub background_execute_ms_http: u64,
    pub background_execute_ms_ws: u64,
    pub background_execute_ms_sse: u64,
    pub background_execute_timeout: Duration,
    pub subscription_retry_min_ms: u64,
    pub subscription_retry_exp_factor: f64,
    pub subscription_retry_max_ms: u64,
    pub stream_handler_retry_min_ms: u64,
    pub stream_handler_retry_exp_factor: f64,
    pub stream_handler_retry_max_ms: u64,
}

impl SubscriptionSettings {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            warmup_subscription_ttl: Duration::from_millis(parse_env(
                "WARMUP_SUBSCRIPTION_TTL",
                300_000u64,
            )?),
            ws_subscription_ttl: Duration::from_millis(parse_env(
                "WS_SUBSCRIPTION_TTL",
                120_000u64,
            )?),
            ws_subscription_unresponsive_ttl: Duration::from_millis(parse_env(
                "WS_SUBSCRIPTION_UNRESPONSIVE_TTL",
                120_000u64,
            )?),
            ws_heartbeat_interval: Duration::from_millis(parse_env(
                "WS_HEARTBEAT_INTERVAL_MS",
                10_000u64,
            )?),
            ws_connection_open_timeout: Duration::from_millis(parse_env(
                "WS_CONNECTION_OPEN_TIMEOUT",
                10_000u64,
            )?),
            background_execute_ms_http: parse_env("BACKGROUND_EXECUTE_MS_HTTP", 1_000u64)?,
            background_execute_ms_ws: parse_env("BACKGROUND_EXECUTE_MS_WS", 1_000u64)?,
            background_execute_ms_sse: parse_env("BACKGROUND_EXECUTE_MS_SSE", 1_000u64)?,
            background_execute_timeout: Duration::from_millis(parse_env(
                "BACKGROUND_EXECUTE_TIMEOUT",
                90_000u64,
            )?),
            subscription_retry_min_ms: parse_env("SUBSCRIPTION_RETRY_MIN_MS", 1_000u64)?,
            subscription_retry_exp_factor: parse_env("SUBSCRIPTION_RETRY_EXP_FACTOR", 2.0f64)?,
            subscription_retry_max_ms: parse_env("SUBSCRIPTION_RETRY_MAX_MS", 60_000u64)?,
            stream_handler_retry_min_ms: parse_env("STREAM_HANDLER_RETRY_MIN_MS", 500u64)?,
            stream_handler_retry_exp_factor: parse_env("STREAM_HANDLER_RETRY_EXP_FACTOR", 2.0f64)?,
            stream_handler_retry_max_ms: parse_env("STREAM_HANDLER_RETRY_MAX_MS", 30_000u64)?,
        })
    }
}

/// Upstream HTTP policy and REST admission knobs.
#[derive(Clone, Debug)]
pub struct RequesterSettings {
    pub retry: u32,
    pub api_timeout: Duration,
    pub max_queue_length: usize,
    pub coalescing_enabled: bool,
    pub coalescing_entropy_max: u64,
    pub rest_max_rate_limit_retries: u32,
    pub rest_ms_between_rate_limit_retries: u64,
}

impl RequesterSettings {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            retry: parse_env("RETRY", 1)?,
            api_timeout: Duration::from_millis(parse_env("API_TIMEOUT", 30_000u64)?),
            max_queue_length: parse_env("MAX_HTTP_REQUEST_QUEUE_LENGTH", 200)?,
            coalescing_enabled: parse_env("REQUEST_COALESCING_ENABLED", false)?,
            coalescing_entropy_max: parse_env("REQUEST_COALESCING_ENTROPY_MAX", 0u64)?,
            rest_max_rate_limit_retries: parse_env("REST_TRANSPORT_MAX_RATE_LIMIT_RETRIES", 3)?,
            rest_ms_between_rate_limit_retries: parse_env(
                "REST_TRANSPORT_MS_BETWEEN_RATE_LIMIT_RETRIES",
                500u64,
            )?,
        })
    }
}

/// Rate-limit tier overrides. Unset values fall back to the adapter's
/// declared tiers.
#[derive(Clone, Debug, Default)]
pub struct RateLimitSettings {
    pub capacity_second: Option<f64>,
    pub capacity_minute: Option<f64>,
    pub capacity_hour: Option<f64>,
}

impl RateLimitSettings {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            capacity_second: parse_optional_env("RATE_LIMIT_CAPACITY_SECOND")?,
            capacity_minute: parse_optional_env("RATE_LIMIT_CAPACITY_MINUTE")?,
            capacity_hour: parse_optional_env("RATE_LIMIT_CAPACITY_HOUR")?,
        })
    }

    pub fn any_set(&self) -> bool {
        self.capacity_second.is_some()
            || self.capacity_minute.is_some()
            || self.capacity_hour.is_some()
    }
}

/// Metrics exposition.
#[derive(Clone, Debug)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub port: u16,
    pub use_base_url: bool,
}

impl MetricsSettings {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            enabled: parse_env("METRICS_ENABLED", true)?,
            port: parse_env("METRICS_PORT", 9080)?,
            use_base_url: parse_env("METRICS_USE_BASE_URL", false)?,
        })
    }
}

/// A custom setting declared by an adapter, resolved from the environment.
#[derive(Clone, Debug)]
pub struct CustomSetting {
    pub name: String,
    pub value: String,
    pub sensitive: bool,
}

/// Complete resolved configuration for one process.
#[derive(Clone, Debug)]
pub struct Settings {
    pub server: ServerSettings,
    pub cache: CacheSettings,
    pub subscriptions: SubscriptionSettings,
    pub requester: RequesterSettings,
    pub rate_limits: RateLimitSettings,
    pub metrics: MetricsSettings,
    /// Adapter-declared settings, keyed by environment variable name.
    pub custom: Vec<CustomSetting>,
}

impl Settings {
    /// Loads every section from the environment and validates cross-field
    /// constraints.
    pub fn from_env() -> Result<Self, ConfigError> {
        let settings = Self {
            server: ServerSettings::from_env()?,
            cache: CacheSettings::from_env()?,
            subscriptions: SubscriptionSettings::from_env()?,
            requester: RequesterSettings::from_env()?,
            rate_limits: RateLimitSettings::from_env()?,
            metrics: MetricsSettings::from_env()?,
            custom: Vec::new(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()
    }

    /// Resolves adapter-declared custom settings from the environment.
    /// `definitions` pairs the variable name with its sensitivity flag.
    pub fn load_custom(&mut self, definitions: &[(&str, bool)]) -> Result<(), ConfigError> {
        for (name, sensitive) in definitions {
            if let Some(value) = optional_env(name) {
                self.custom.push(CustomSetting {
                    name: name.to_string(),
                    value,
                    sensitive: *sensitive,
                });
            }
        }
        Ok(())
    }

    /// Looks up a custom setting value by variable name.
    pub fn custom_setting(&self, name: &str) -> Option<&str> {
        self.custom
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.value.as_str())
    }
}

/// Reads an environment variable, trimming whitespace. Unset or empty
/// variables read as absent.
pub(crate) fn optional_env(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(v) => {
            let trimmed = v.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        }
        Err(_) => None,
    }
}

/// Parses an environment variable with a default, turning parse failures
/// into a `ConfigError` naming the variable.
pub(crate) fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match optional_env(name) {
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
            key: name.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_optional_env<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match optional_env(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: name.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

/// Normalizes the base URL to a leading-slash, no-trailing-slash form.
/// The root stays "/".
fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_server() -> ServerSettings {
        ServerSettings {
            mode: EaMode::ReaderWriter,
            host: "0.0.0.0".into(),
            port: 8080,
            base_url: "/".into(),
            max_payload_size_limit: 1_048_576,
            tls_enabled: false,
            mtls_enabled: false,
            tls_private_key: None,
            tls_public_key: None,
            tls_ca: None,
            tls_passphrase: None,
        }
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("reader".parse::<EaMode>().unwrap(), EaMode::Reader);
        assert_eq!("writer".parse::<EaMode>().unwrap(), EaMode::Writer);
        assert_eq!(
            "reader-writer".parse::<EaMode>().unwrap(),
            EaMode::ReaderWriter
        );
        assert!("both".parse::<EaMode>().is_err());

        assert!(EaMode::Reader.is_reader());
        assert!(!EaMode::Reader.is_writer());
        assert!(EaMode::Writer.is_writer());
        assert!(!EaMode::Writer.is_reader());
        assert!(EaMode::ReaderWriter.is_reader() && EaMode::ReaderWriter.is_writer());
    }

    #[test]
    fn tls_and_mtls_are_mutually_exclusive() {
        let mut server = base_server();
        server.tls_enabled = true;
        server.mtls_enabled = true;
        server.tls_private_key = Some("key.pem".into());
        server.tls_public_key = Some("cert.pem".into());
        server.tls_ca = Some("ca.pem".into());
        let err = server.validate().unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn mtls_requires_full_material() {
        let mut server = base_server();
        server.mtls_enabled = true;
        server.tls_private_key = Some("key.pem".into());
        server.tls_public_key = Some("cert.pem".into());
        let err = server.validate().unwrap_err();
        assert!(err.to_string().contains("TLS_CA"));
    }

    #[test]
    fn base_url_normalization() {
        assert_eq!(normalize_base_url("/"), "/");
        assert_eq!(normalize_base_url(""), "/");
        assert_eq!(normalize_base_url("/adapter/"), "/adapter");
        assert_eq!(normalize_base_url("adapter"), "/adapter");
    }
}
