//! Cachework — a multi-backend cache engine and a webhook delivery engine
//!
//! # Cache engine
//!
//! [`cache::Manager`] orchestrates a pluggable [`cache::Backend`]
//! (in-memory, on-disk, embedded-SQL, or remote key-value), a
//! [`cache::version::VersionManager`] for namespace invalidation, and a
//! [`cache::key`] codec that turns `(model_id, operation, inputs,
//! parameters)` into a canonical, collision-resistant key.
//!
//! # Webhook delivery engine
//!
//! [`webhook::repository::Repository`] persists webhooks, deliveries, and
//! attempts; [`webhook::delivery::Engine`] queues, dispatches, retries, and
//! dead-letters deliveries; [`webhook::emitter::Emitter`] fans local events
//! out to both in-process listeners and the delivery engine;
//! [`webhook::middleware`] enforces an IP allowlist and a rate limit on the
//! inbound management surface.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod error;
pub mod webhook;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize `tracing` with an `env_filter` level and either plain or JSON
/// formatting. Call once at process startup; safe to skip entirely in tests.
///
/// # Errors
///
/// Returns [`Error::Config`] if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    result.map_err(|e| Error::Config(e.to_string()))
}
