// src/observability.rs
//! Logging setup
//!
//! Output always goes to stderr: the interposed process owns stdout. Metrics
//! are recorded through the `metrics` facade and reach whatever recorder the
//! host process installs; see the `*_TOTAL` constants next to each recorder
//! call site.

use crate::utils::config::LoggingConfig;
use crate::utils::errors::{InterposeError, Result};
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber
///
/// `RUST_LOG` wins over the configured filter. Calling this when a
/// subscriber is already installed is not an error.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter).map_err(|e| {
            InterposeError::ConfigError(format!(
                "invalid logging.filter {:?}: {}",
                config.filter, e
            ))
        })?,
    };

    let installed = if config.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .try_init()
    };

    if let Err(e) = installed {
        debug!("Keeping existing tracing subscriber: {}", e);
    }
    Ok(())
}
