// src/utils/errors.rs
//! Error taxonomy for the interposition layer
//!
//! Every failure is classified so that the call interceptors can tell a
//! mediator-reported application error apart from a broken channel or a
//! corrupted frame. Only [`InterposeError::MediatorRejected`] is a normal
//! per-call failure; the other kinds abort the current call.

use nix::errno::Errno;
use std::io;
use thiserror::Error;

/// Interposition layer errors
#[derive(Debug, Error)]
pub enum InterposeError {
    /// The control channel broke mid-roundtrip
    #[error("Transport error: {0}")]
    TransportError(String),

    /// A control channel to the mediator could not be established
    #[error("Cannot reach mediator: {0}")]
    ChannelOpen(String),

    /// A frame violated the fixed-size / per-call field contract
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The local handle has no session registry entry
    #[error("Unknown handle: {0}")]
    UnknownHandle(i32),

    /// The mediator executed the call and reported a failure
    #[error("Mediator rejected {call}: errno {errno}")]
    MediatorRejected { call: &'static str, errno: i32 },

    /// A handle was registered twice
    #[error("Duplicate handle: {0}")]
    DuplicateHandle(i32),

    /// The call is not legal in the handle's current state
    #[error("Invalid state for {call}: {state}")]
    InvalidState {
        call: &'static str,
        state: &'static str,
        errno: i32,
    },

    /// The configured live session bound has been reached
    #[error("Session limit reached: {0} live sessions")]
    SessionLimit(usize),

    /// Only IPv4 addresses can be encoded on the wire
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A caller-supplied argument cannot be interpreted
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The genuine OS call used for fallback failed
    #[error("Native call failed: {0}")]
    Native(#[from] io::Error),
}

impl InterposeError {
    /// Native errno reported to the caller of the intercepted function
    pub fn errno(&self) -> i32 {
        match self {
            InterposeError::TransportError(_) => libc::EIO,
            InterposeError::ChannelOpen(_) => libc::ECONNREFUSED,
            InterposeError::MalformedFrame(_) => libc::EPROTO,
            InterposeError::UnknownHandle(_) => libc::EBADF,
            InterposeError::MediatorRejected { errno, .. } => *errno,
            InterposeError::DuplicateHandle(_) => libc::EEXIST,
            InterposeError::InvalidState { errno, .. } => *errno,
            InterposeError::SessionLimit(_) => libc::EMFILE,
            InterposeError::Unsupported(_) => libc::EAFNOSUPPORT,
            InterposeError::InvalidArgument(_) => libc::EINVAL,
            InterposeError::ConfigError(_) => libc::EINVAL,
            InterposeError::Native(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Human readable description of [`InterposeError::errno`]
    pub fn errno_desc(&self) -> &'static str {
        Errno::from_i32(self.errno()).desc()
    }

    /// Whether the failure came from the mediator rather than the transport
    pub fn is_mediator_rejection(&self) -> bool {
        matches!(self, InterposeError::MediatorRejected { .. })
    }

    /// Whether the failure means the channel can no longer be trusted
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            InterposeError::TransportError(_)
                | InterposeError::ChannelOpen(_)
                | InterposeError::MalformedFrame(_)
        )
    }
}

impl From<config::ConfigError> for InterposeError {
    fn from(e: config::ConfigError) -> Self {
        InterposeError::ConfigError(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, InterposeError>;
