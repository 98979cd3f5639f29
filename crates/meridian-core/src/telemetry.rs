//! Tracing setup for embedders and the probe binary.
//!
//! The core only emits events; installing a subscriber is the caller's choice.

use tracing_subscriber::EnvFilter;

/// Filter built from `RUST_LOG`, falling back to `default_level`.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install a global fmt subscriber.
///
/// Returns `false` when a global subscriber was already set.
pub fn init_tracing(default_level: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_target(false)
        .try_init()
        .is_ok()
}
