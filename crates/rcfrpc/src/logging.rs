//! Subscriber setup for binaries and ad-hoc runs.
//!
//! The runtime itself only emits `tracing` events. Harness levels map onto
//! them as RING → `info!`, WARN → `warn!`, ERROR → `error!` and
//! VERB → `debug!`.

use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Does nothing if a global subscriber is already set.
pub fn init() {
    init_with_level("info");
}

/// Like `init`, with `level` used when `RUST_LOG` is unset or unparsable.
pub fn init_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
