pub mod app;
pub mod config;
pub mod encoding;
pub mod error;
pub mod handlers;
pub mod hits;
pub mod metrics;
pub mod pings;
pub mod protosessions;
pub mod publishers;
pub mod queue;
pub mod receiver;
pub mod server;
pub mod signals;
pub mod storage;
pub mod ttlcache;
pub mod warehouse;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging
///
/// `RUST_LOG` wins over `level` when set. `format` is `text` or `json`.
///
/// Note: This function can only be called once.
pub fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}
