//! Logging initialisation.

use crate::config::GeneralConfig;
use crate::error::{Result, StrataError};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber filtered at `log_level`.
///
/// `RUST_LOG` takes precedence over the configured level. Fails if another
/// global subscriber is already installed.
pub fn init(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| StrataError::internal(format!("Failed to initialize logging: {}", e)))
}

/// Initialise logging from the `[general]` section.
pub fn init_from_config(config: &GeneralConfig) -> Result<()> {
    init(&config.log_level)
}
