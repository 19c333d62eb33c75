#![cfg_attr(docsrs, feature(doc_cfg))]

//! A framework for building external adapter services.
//!
//! An external adapter is a long-lived HTTP service that translates a fixed
//! client request envelope into calls against an upstream data provider and
//! answers from a shared, TTL'd response cache. Clients never wait on the
//! provider: the cache is kept warm by background loops, and a cold cache
//! answers 504 until the first background cycle fills it.
//!
//! # High-level pieces
//! - [`adapter::Adapter`] and [`adapter::Endpoint`] describe the integration
//! - Transports obtain provider values: [`transport::RestTransport`]
//!   (foreground, one request per client request),
//!   [`transport::BatchTransport`] (background polling),
//!   [`transport::WsTransport`] and [`transport::SseTransport`] (streaming)
//! - The [`cache`] module holds the local and Redis-backed response caches,
//!   the response-cache facade, and the distributed writer lock
//! - [`subscription`] tracks which parameter tuples the background loops
//!   must keep warm, with per-entry TTLs
//! - [`rate_limit`] spreads the provider's request budget across endpoints
//! - [`requester`] queues, coalesces and retries all provider HTTP calls
//!
//! # Quickstart
//!
//! ```rust,no_run
//! use feedbridge::adapter::{Adapter, Endpoint};
//! use feedbridge::transport::BatchTransport;
//! # fn endpoint_impl() -> impl feedbridge::transport::BatchEndpoint { unimplemented!() }
//!
//! # async fn example() -> Result<(), feedbridge::error::AdapterError> {
//! let adapter = Adapter::new("EXAMPLE")
//!     .endpoint(Endpoint::new("price", BatchTransport::new(endpoint_impl())).input_fields(&["base", "quote"]));
//! feedbridge::start(adapter).await
//! # }
//! ```
//!
//! # Process roles
//! The same binary runs as `reader` (front door only), `writer` (background
//! loops and cache writes only) or `reader-writer`, selected by `EA_MODE`.
//! Replicas share nothing but the remote cache, the subscription sets and
//! the writer lock.

/// Adapter and endpoint definitions, validation, and the process runtime.
pub mod adapter;

/// Background executor driving per-endpoint transport loops.
pub mod background;

/// Key/value response caching: local LRU, Redis, facade, writer lock.
pub mod cache;

/// Redaction of sensitive setting values from cached responses.
pub mod censor;

/// Environment-driven configuration.
pub mod config;

/// Error taxonomy with fixed HTTP status mappings.
pub mod error;

/// Prometheus metric points and the exposition listener.
pub mod metrics;

/// Request parameters, canonical JSON, and cache key derivation.
pub mod params;

/// Upstream rate limiting and per-endpoint pacing.
pub mod rate_limit;

/// Outbound HTTP requester with queueing, coalescing and retries.
pub mod requester;

/// Adapter response types and timestamps.
pub mod response;

/// HTTP front door.
mod server;

/// TLS/mTLS front door.
mod server_tls;

/// Cooperative shutdown signal fan-out.
pub mod shutdown;

/// Time-expiring sets of desired request parameters.
pub mod subscription;

/// Structured logging setup.
pub mod tracing;

/// Transport contract and implementations.
pub mod transport;

pub use adapter::{Adapter, Endpoint, start};
pub use error::AdapterError;
pub use params::RequestParams;
pub use response::{AdapterResponse, PartialResponse, ProviderResult};
