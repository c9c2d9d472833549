//! Optional subscriber for the spans and events emitted by runs.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs a global `fmt` subscriber filtered by `RUST_LOG`, defaulting to
/// `info`. Does nothing if a global subscriber is already set.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init();
}
