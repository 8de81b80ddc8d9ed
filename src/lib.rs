// src/lib.rs
//! Network Call Interposer Library
//!
//! Transparently redirects an unmodified program's IPv4 socket calls to an
//! external mediator process that simulates the network.
//!
//! # Architecture
//!
//! - **protocol**: fixed-size request/response frames and per-call schemas
//! - **interception**: call interceptors, session registry, control channels
//! - **listener**: mediator-side channel listener and call processor contract
//! - **observability**: logging setup
//! - **utils**: configuration and error types
//!
//! Build with `--features preload` to produce a shared library that exports
//! the socket API for `LD_PRELOAD`.

// Public module exports
pub mod interception;
pub mod listener;
pub mod observability;
pub mod protocol;
pub mod utils;

// Re-export commonly used types
pub use interception::{Interposer, LibcSocketApi, NativeSocketApi, SessionRegistry};
pub use listener::{BackgroundListener, CallProcessor, MediatorListener};
pub use protocol::{Call, Request, Response, SessionId};
pub use utils::config::InterposerConfig;
pub use utils::errors::{InterposeError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
