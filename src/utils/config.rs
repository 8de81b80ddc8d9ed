// src/utils/config.rs
//! Interposer configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional file
//! named by `NETINTERPOSE_CONFIG`, then `NETINTERPOSE_*` environment
//! variables (`__` separates nested keys, e.g. `NETINTERPOSE_MEDIATOR__PORT`).

use crate::utils::errors::{InterposeError, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for all settings
pub const ENV_PREFIX: &str = "NETINTERPOSE";

/// Environment variable naming an optional configuration file
pub const CONFIG_PATH_ENV: &str = "NETINTERPOSE_CONFIG";

/// Default mediator port
pub const DEFAULT_MEDIATOR_PORT: u16 = 53678;

/// Default bound on concurrently live sessions
pub const DEFAULT_MAX_SESSIONS: usize = 1024;

/// Top-level interposer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterposerConfig {
    pub mediator: MediatorConfig,
    pub sessions: SessionConfig,
    pub logging: LoggingConfig,
}

/// Where and how to reach the mediator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediatorConfig {
    /// Mediator address (loopback)
    pub host: Ipv4Addr,

    /// Mediator port
    pub port: u16,

    /// Optional bound on each round trip; unset blocks until the mediator answers
    #[serde(default)]
    pub roundtrip_timeout_ms: Option<u64>,
}

impl MediatorConfig {
    pub fn endpoint(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.host, self.port)
    }

    pub fn roundtrip_timeout(&self) -> Option<Duration> {
        self.roundtrip_timeout_ms.map(Duration::from_millis)
    }
}

/// Session bookkeeping limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum number of live sessions (each owns one channel)
    pub max_sessions: usize,
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG` when set
    pub filter: String,

    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for InterposerConfig {
    fn default() -> Self {
        Self {
            mediator: MediatorConfig {
                host: Ipv4Addr::LOCALHOST,
                port: DEFAULT_MEDIATOR_PORT,
                roundtrip_timeout_ms: None,
            },
            sessions: SessionConfig {
                max_sessions: DEFAULT_MAX_SESSIONS,
            },
            logging: LoggingConfig {
                filter: "warn".to_string(),
                json: false,
            },
        }
    }
}

impl InterposerConfig {
    /// Load from defaults, `NETINTERPOSE_CONFIG` and `NETINTERPOSE_*` variables
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok();
        Self::load_with(path.as_deref().map(Path::new), ENV_PREFIX)
    }

    /// Load from an explicit file and environment prefix
    pub fn load_with(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let defaults = Self::default();

        let mut builder = config::Config::builder()
            .set_default("mediator.host", defaults.mediator.host.to_string())?
            .set_default("mediator.port", i64::from(defaults.mediator.port))?
            .set_default("sessions.max_sessions", defaults.sessions.max_sessions as i64)?
            .set_default("logging.filter", defaults.logging.filter)?
            .set_default("logging.json", defaults.logging.json)?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the interposer cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.mediator.port == 0 {
            return Err(InterposeError::ConfigError(
                "mediator.port cannot be 0".to_string(),
            ));
        }
        if self.sessions.max_sessions == 0 {
            return Err(InterposeError::ConfigError(
                "sessions.max_sessions cannot be 0".to_string(),
            ));
        }
        if self.mediator.roundtrip_timeout_ms == Some(0) {
            return Err(InterposeError::ConfigError(
                "mediator.roundtrip_timeout_ms cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}
