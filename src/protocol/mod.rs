// src/protocol/mod.rs
//! Wire protocol between the interposer and the mediator
//!
//! - **Frame**: fixed-size request/response units and the field reader
//! - **Request**: typed calls and their per-call schemas
//! - **Response**: success/rejection outcomes and payload parsers
//!
//! # Layout
//!
//! ```text
//! request   "send\0\0…"  "7,0,4,ping\0\0…"
//!            └ 20 bytes ┘ └── 2048 bytes ──┘
//!                          │ │ │ └ payload, read verbatim
//!                          │ │ └ payload length
//!                          │ └ flags
//!                          └ remote session
//!
//! response  [status: i32 LE][payload: 2048 bytes]
//!            >= 0  success, status = meaningful payload bytes
//!            <  0  rejected, errno = -status
//! ```

pub mod frame;
pub mod request;
pub mod response;

/// Mediator-side session identifier
pub type SessionId = i32;

// Re-export commonly used types
pub use frame::{RequestFrame, ResponseFrame, REQUEST_FRAME_LEN, RESPONSE_FRAME_LEN};
pub use request::{Call, Request};
pub use response::Response;
