//! Adapter definition and process assembly.
//!
//! An [`Adapter`] names the provider integration, its endpoints, their
//! transports, and the provider's rate-limit tiers. [`start`] resolves the
//! environment, validates the definition, builds the shared dependency
//! bundle (cache, subscription sets, requester, rate limiter, metrics),
//! acquires the writer lock where required, wires every transport, spawns
//! the background loops, and serves the front door until shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::background;
use crate::cache::{Cache, DistributedLock, LocalCache, RemoteCache, ResponseCache};
use crate::censor::{CensorItem, CensorList};
use crate::config::{CacheType, Settings};
use crate::error::AdapterError;
use crate::metrics::{Metrics, serve_metrics};
use crate::params::{lock_key, subscription_set_key};
use crate::rate_limit::{EndpointAllocation, RateLimitTiers, RateLimiter};
use crate::requester::{Requester, RequesterConfig};
use crate::server;
use crate::server_tls;
use crate::shutdown::Shutdown;
use crate::subscription::{LocalSubscriptionSet, RemoteSubscriptionSet, SubscriptionSet};
use crate::transport::{Transport, TransportInit};

/// One named capability of an adapter, backed by exactly one transport.
pub struct Endpoint {
    pub(crate) name: String,
    pub(crate) aliases: Vec<String>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) allocation_percentage: Option<u8>,
    pub(crate) input_fields: Vec<String>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, transport: impl Transport + 'static) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            transport: Arc::new(transport),
            allocation_percentage: None,
            input_fields: Vec::new(),
        }
    }

    /// Adds an alternate name routing to this endpoint.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Reserves an explicit share of the adapter's rate-limit budget.
    pub fn allocation_percentage(mut self, percentage: u8) -> Self {
        self.allocation_percentage = Some(percentage);
        self
    }

    /// Declares which request parameters form the feed id. Defaults to all.
    pub fn input_fields(mut self, fields: &[&str]) -> Self {
        self.input_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }
}

/// A provider integration: name, endpoints, tiers, custom settings.
pub struct Adapter {
    pub(crate) name: String,
    pub(crate) default_endpoint: Option<String>,
    pub(crate) endpoints: Vec<Endpoint>,
    pub(crate) rate_limits: Option<RateLimitTiers>,
    pub(crate) setting_definitions: Vec<(&'static str, bool)>,
}

impl Adapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_endpoint: None,
            endpoints: Vec::new(),
            rate_limits: None,
            setting_definitions: Vec::new(),
        }
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Endpoint used when a request names none.
    pub fn default_endpoint(mut self, name: impl Into<String>) -> Self {
        self.default_endpoint = Some(name.into());
        self
    }

    pub fn rate_limits(mut self, tiers: RateLimitTiers) -> Self {
        self.rate_limits = Some(tiers);
        self
    }

    /// Declares a custom setting resolved from the environment at startup.
    /// Sensitive settings are censored out of every cached response.
    pub fn setting(mut self, env_name: &'static str, sensitive: bool) -> Self {
        self.setting_definitions.push((env_name, sensitive));
        self
    }

    /// Startup validation: uppercase adapter name, at least one endpoint,
    /// no duplicate endpoint names or aliases, known default endpoint.
    pub fn validate(&self) -> Result<(), AdapterError> {
        if self.name.is_empty() {
            return Err(AdapterError::Setup("adapter name must not be empty".into()));
        }
        if self.name != self.name.to_uppercase() {
            return Err(AdapterError::Setup(format!(
                "adapter name must be uppercase: \"{}\"",
                self.name
            )));
        }
        if self.endpoints.is_empty() {
            return Err(AdapterError::Setup(
                "adapter must define at least one endpoint".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for endpoint in &self.endpoints {
            for name in std::iter::once(&endpoint.name).chain(endpoint.aliases.iter()) {
                if !seen.insert(name.clone()) {
                    return Err(AdapterError::Setup(format!(
                        "Duplicate endpoint / alias: \"{name}\""
                    )));
                }
            }
        }

        if let Some(default) = &self.default_endpoint {
            if !seen.contains(default) {
                return Err(AdapterError::Setup(format!(
                    "default endpoint \"{default}\" is not a known endpoint or alias"
                )));
            }
        }
        Ok(())
    }
}

/// One endpoint as wired at runtime.
pub struct EndpointRuntime {
    pub name: String,
    pub transport: Arc<dyn Transport>,
    pub input_fields: Vec<String>,
}

/// The running adapter, shared with the front door.
pub struct AdapterRuntime {
    pub name: String,
    pub default_endpoint: Option<String>,
    pub endpoints: HashMap<String, Arc<EndpointRuntime>>,
    pub settings: Arc<Settings>,
    pub response_cache: Arc<ResponseCache>,
    pub metrics: Arc<Metrics>,
}

impl AdapterRuntime {
    /// Resolves a requested endpoint name (or the default) to its runtime.
    pub fn resolve_endpoint(
        &self,
        requested: Option<&str>,
    ) -> Result<&Arc<EndpointRuntime>, AdapterError> {
        let name = match requested {
            Some(name) if !name.is_empty() => name,
            _ => self.default_endpoint.as_deref().ok_or_else(|| {
                AdapterError::Input(
                    "request named no endpoint and the adapter has no default".into(),
                )
            })?,
        };
        self.endpoints
            .get(name)
            .ok_or_else(|| AdapterError::Input(format!("Endpoint not found: \"{name}\"")))
    }
}

/// Loads settings from the environment and runs the adapter to completion.
pub async fn start(adapter: Adapter) -> Result<(), AdapterError> {
    let mut settings = Settings::from_env()?;
    settings.load_custom(&adapter.setting_definitions)?;
    run(adapter, settings).await
}

/// Runs an adapter with explicit settings. Returns after graceful shutdown,
/// or with a fatal error when startup fails.
pub async fn run(adapter: Adapter, settings: Settings) -> Result<(), AdapterError> {
    crate::tracing::init_tracing();
    adapter.validate()?;
    settings.validate()?;
    let settings = Arc::new(settings);
    let shutdown = Shutdown::new();

    let metrics = Arc::new(
        Metrics::new().map_err(|e| AdapterError::Setup(format!("metrics registry: {e}")))?,
    );

    let (cache, redis_conn): (Arc<dyn Cache>, Option<redis::aio::MultiplexedConnection>) =
        match settings.cache.cache_type {
            CacheType::Local => (Arc::new(LocalCache::new(settings.cache.max_items)), None),
            CacheType::Remote => {
                let remote = RemoteCache::connect(&settings.cache.redis_url).await?;
                let conn = remote.connection();
                (Arc::new(remote), Some(conn))
            }
        };

    // At most one writer replica per namespace when the cache is shared.
    let mut lock = None;
    if settings.server.mode.is_writer() {
        if let Some(conn) = &redis_conn {
            let key = lock_key(settings.cache.prefix.as_deref(), &adapter.name);
            let acquired = DistributedLock::acquire(
                conn.clone(),
                key,
                settings.cache.lock_duration,
                settings.cache.lock_retries,
            )
            .await?;
            acquired.spawn_extension(shutdown.clone());
            lock = Some(acquired);
        } else if adapter
            .endpoints
            .iter()
            .any(|e| e.transport.has_background())
        {
            tracing::warn!(
                "local cache with subscription transports is single-replica only; \
                 use CACHE_TYPE=remote to run more than one replica"
            );
        }
    }

    let mut censor_extra = Vec::new();
    if let Some(passphrase) = &settings.server.tls_passphrase {
        censor_extra.push(CensorItem::new("TLS_PASSPHRASE", passphrase.clone()));
    }
    let censor = CensorList::from_settings(&settings.custom, censor_extra);

    let response_cache = Arc::new(ResponseCache::new(
        cache.clone(),
        metrics.clone(),
        censor.clone(),
        adapter.name.clone(),
        settings.cache.prefix.clone(),
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

    let allocations: Vec<EndpointAllocation> = adapter
        .endpoints
        .iter()
        .map(|e| EndpointAllocation {
            endpoint_name: e.name.clone(),
            allocation_percentage: e.allocation_percentage,
        })
        .collect();
    let rate_limiter = Arc::new(RateLimiter::new(
        adapter.rate_limits,
        &settings.rate_limits,
        &allocations,
    )?);

    let mut endpoints = HashMap::new();
    let mut background_transports = Vec::new();
    for endpoint in &adapter.endpoints {
        let transport = endpoint.transport.clone();
        let subscription_set: Arc<dyn SubscriptionSet> = match &redis_conn {
            Some(conn) => Arc::new(RemoteSubscriptionSet::new(
                conn.clone(),
                subscription_set_key(
                    settings.cache.prefix.as_deref(),
                    &adapter.name,
                    &endpoint.name,
                    transport.name(),
                ),
            )),
            None => Arc::new(LocalSubscriptionSet::new()),
        };

        transport
            .initialize(TransportInit {
                adapter_name: adapter.name.clone(),
                endpoint_name: endpoint.name.clone(),
                input_fields: endpoint.input_fields.clone(),
                settings: settings.clone(),
                response_cache: response_cache.clone(),
                cache: cache.clone(),
                requester: requester.clone(),
                rate_limiter: rate_limiter.clone(),
                metrics: metrics.clone(),
                subscription_set,
                shutdown: shutdown.clone(),
            })
            .await?;

        let runtime = Arc::new(EndpointRuntime {
            name: endpoint.name.clone(),
            transport: transport.clone(),
            input_fields: endpoint.input_fields.clone(),
        });
        endpoints.insert(endpoint.name.clone(), runtime.clone());
        for alias in &endpoint.aliases {
            endpoints.insert(alias.clone(), runtime.clone());
        }

        if settings.server.mode.is_writer() && transport.has_background() {
            background_transports.push((endpoint.name.clone(), transport));
        }
    }

    let runtime = Arc::new(AdapterRuntime {
        name: adapter.name.clone(),
        default_endpoint: adapter
            .default_endpoint
            .clone()
            .or_else(|| adapter.endpoints.first().map(|e| e.name.clone())),
        endpoints,
        settings: settings.clone(),
        response_cache: response_cache.clone(),
        metrics: metrics.clone(),
    });

    let mut handles = Vec::new();
    for (endpoint_name, transport) in background_transports {
        handles.push(background::spawn_loop(
            endpoint_name,
            transport,
            settings.clone(),
            rate_limiter.clone(),
            metrics.clone(),
            shutdown.clone(),
        ));
    }

    if settings.metrics.enabled {
        let addr = format!("{}:{}", settings.server.host, settings.metrics.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| AdapterError::Setup(format!("failed to bind metrics on {addr}: {e}")))?;
        let path = if settings.metrics.use_base_url && settings.server.base_url != "/" {
            format!("{}/metrics", settings.server.base_url)
        } else {
            "/metrics".to_string()
        };
        handles.push(tokio::spawn(serve_metrics(
            listener,
            metrics.clone(),
            path,
            shutdown.clone(),
        )));
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                shutdown.trigger();
            }
        });
    }

    // Startup heartbeat: resolved configuration, redacted through the
    // censor list.
    let custom: serde_json::Map<String, serde_json::Value> = settings
        .custom
        .iter()
        .map(|s| (s.name.clone(), serde_json::Value::String(s.value.clone())))
        .collect();
    let mut config_summary = serde_json::json!({
        "mode": settings.server.mode.to_string(),
        "host": settings.server.host,
        "port": settings.server.port,
        "baseUrl": settings.server.base_url,
        "tlsEnabled": settings.server.tls_enabled,
        "mtlsEnabled": settings.server.mtls_enabled,
        "cacheType": format!("{:?}", settings.cache.cache_type),
        "cacheMaxItems": settings.cache.max_items,
        "cacheMaxAgeMs": settings.cache.max_age.as_millis() as u64,
        "cachePrefix": settings.cache.prefix,
        "warmupSubscriptionTtlMs": settings.subscriptions.warmup_subscription_ttl.as_millis() as u64,
        "retry": settings.requester.retry,
        "apiTimeoutMs": settings.requester.api_timeout.as_millis() as u64,
        "requestCoalescingEnabled": settings.requester.coalescing_enabled,
        "metricsEnabled": settings.metrics.enabled,
        "metricsPort": settings.metrics.port,
        "custom": custom,
    });
    censor.censor_value(&mut config_summary);

    tracing::info!(
        adapter = %adapter.name,
        mode = %settings.server.mode,
        endpoints = adapter.endpoints.len(),
        config = %config_summary,
        "adapter started"
    );

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| AdapterError::Setup(format!("failed to bind {addr}: {e}")))?;

    if settings.server.tls_active() {
        server_tls::serve_tls(listener, runtime, shutdown.clone()).await?;
    } else {
        server::serve(listener, runtime, shutdown.clone()).await;
    }

    shutdown.trigger();
    for handle in handles {
        let _ = handle.await;
    }
    if let Some(lock) = lock {
        lock.release().await;
    }
    tracing::info!(adapter = %adapter.name, "adapter stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::RequestParams;
    use crate::requester::{ProviderRequest, ProviderResponse};
    use crate::response::PartialResponse;
    use crate::transport::{RestEndpoint, RestTransport};

    struct NullEndpoint;

    impl RestEndpoint for NullEndpoint {
        fn prepare_request(
            &self,
            _params: &RequestParams,
            _settings: &Settings,
        ) -> Result<ProviderRequest, AdapterError> {
            Ok(ProviderRequest::get("http://127.0.0.1:1/"))
        }

        fn parse_response(
            &self,
            _params: &RequestParams,
            _response: &ProviderResponse,
            _settings: &Settings,
        ) -> Result<PartialResponse, AdapterError> {
            Ok(PartialResponse::success(serde_json::json!({}), serde_json::json!(0)))
        }
    }

    fn endpoint(name: &str) -> Endpoint {
        Endpoint::new(name, RestTransport::new(NullEndpoint))
    }

    #[test]
    fn lowercase_adapter_name_is_rejected() {
        let adapter = Adapter::new("test").endpoint(endpoint("price"));
        let err = adapter.validate().unwrap_err();
        assert!(err.to_string().contains("uppercase"));
    }

    #[test]
    fn duplicate_alias_is_rejected_with_the_offending_name() {
        let adapter = Adapter::new("TEST")
            .endpoint(endpoint("test"))
            .endpoint(endpoint("another").alias("test"));
        let err = adapter.validate().unwrap_err();
        assert!(err.to_string().contains(r#"Duplicate endpoint / alias: "test""#));
    }

    #[test]
    fn unknown_default_endpoint_is_rejected() {
        let adapter = Adapter::new("TEST")
            .endpoint(endpoint("price"))
            .default_endpoint("quote");
        assert!(adapter.validate().is_err());
    }

    #[test]
    fn aliases_are_valid_defaults() {
        let adapter = Adapter::new("TEST")
            .endpoint(endpoint("price").alias("crypto"))
            .default_endpoint("crypto");
        assert!(adapter.validate().is_ok());
    }

    #[test]
    fn empty_adapter_is_rejected() {
        assert!(Adapter::new("TEST").validate().is_err());
    }
}
