//! Structured logging setup.
//!
//! Installs a `tracing` subscriber honoring `RUST_LOG`, defaulting to `info`.
//! Initialization is idempotent so embedding applications that install their
//! own subscriber first keep theirs.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes the global tracing subscriber with formatted output.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true),
        )
        .with(filter)
        .try_init();
}
