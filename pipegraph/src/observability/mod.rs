//! Tracing subscriber setup.
//!
//! The engine only emits `tracing` events; installing a subscriber is left
//! to the embedding process, which can call [`init_tracing`] once at start-up.

use crate::config::{LogConfig, LogFormat};
use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global `tracing` subscriber for the given configuration.
///
/// `RUST_LOG` takes precedence over [`LogConfig::level`]. Returns `false` if a
/// global subscriber was already installed, in which case nothing changes.
pub fn init_tracing(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match config.format {
        LogFormat::Pretty => fmt().with_env_filter(filter).with_target(true).try_init(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .try_init(),
    };
    result.is_ok()
}
