//! Tracing-subscriber initialization helpers.
//!
//! The engine itself only emits `tracing` events; installing a subscriber is
//! the embedder's call. These helpers cover the common cases.
//!
//! The log level is controlled by the `RUST_LOG` environment variable:
//!
//! ```bash
//! RUST_LOG=mazurka_core=debug cargo run
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging with sensible defaults.
///
/// Call once at startup, before the server is created. The level is taken
/// from `RUST_LOG`, defaulting to `info`.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize logging with an explicit level instead of `RUST_LOG`.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
