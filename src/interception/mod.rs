// src/interception/mod.rs
//! Socket call interception layer
//!
//! - **Interposer**: one interceptor per socket call, routing it to the mediator
//! - **Session Registry**: local handle to mediator session mapping
//! - **Channel**: per-session control connections and roundtrips
//! - **Resolver**: genuine OS socket calls, bypassing interception
//! - **Preload**: C ABI exports for `LD_PRELOAD` (feature `preload`)
//!
//! # Architecture
//!
//! ```text
//! Application (unmodified)
//!     │ socket()/connect()/send()/...
//!     ▼
//! preload exports ──► Interposer ──► SessionRegistry ──► Session
//!                                                          │
//!                          ChannelManager::roundtrip ◄─────┘
//!                                     │ request frame
//!                                     ▼
//!                                 mediator
//! ```

pub mod channel;
pub mod interposer;
#[cfg(feature = "preload")]
pub mod preload;
pub mod resolver;
pub mod session_registry;

// Re-export commonly used types
pub use channel::{ChannelManager, ControlChannel};
pub use interposer::Interposer;
pub use resolver::{LibcSocketApi, NativeSocketApi};
pub use session_registry::{LocalHandle, Session, SessionRegistry, SocketState};
