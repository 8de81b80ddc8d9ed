// src/listener/mod.rs
//! Mediator-side frame listener
//!
//! The counterpart of the interposer: accepts control channels, decodes
//! request frames and hands each call to a [`CallProcessor`].
//!
//! ```text
//! interposer channel ──► MediatorCodec ──► Request::decode ──► CallProcessor
//!                    ◄── ResponseFrame ◄── Response::encode ◄──┘
//! ```

pub mod codec;
pub mod processor;
pub mod server;

// Re-export commonly used types
pub use codec::MediatorCodec;
pub use processor::CallProcessor;
pub use server::{BackgroundListener, MediatorListener};
