//! Log output setup for binaries and demos embedding the client.

use tracing_subscriber::EnvFilter;

use crate::config::RealtimeConfig;

/// Default filter: this crate at `debug` in debug mode, `info` otherwise,
/// everything else at `warn`.
pub fn default_filter(config: &RealtimeConfig) -> String {
    let level = if config.debug_mode { "debug" } else { "info" };
    format!("warn,edu_realtime={level}")
}

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` wins over [`default_filter`]. Returns `false` if a global
/// subscriber was already installed.
pub fn init_tracing(config: &RealtimeConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(config)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
