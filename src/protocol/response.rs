// src/protocol/response.rs
//! Response outcomes and the structured data they carry
//!
//! A non-negative status is success and declares how many payload bytes are
//! meaningful. A negative status is a mediator rejection carrying `-errno`.

use crate::protocol::frame::{encode_addr, FieldReader, ResponseFrame, PAYLOAD_FIELD_LEN};
use crate::protocol::request::Call;
use crate::protocol::SessionId;
use crate::utils::errors::{InterposeError, Result};
use bytes::Bytes;
use std::net::SocketAddrV4;

/// Decoded response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The call succeeded; payload layout depends on the call
    Success(Bytes),

    /// The mediator rejected the call with this errno
    Rejected(i32),
}

impl Response {
    /// Success carrying a decimal integer (`0` for plain acknowledgements)
    pub fn int(value: i64) -> Self {
        Response::Success(Bytes::from(value.to_string()))
    }

    /// Success carrying raw bytes, truncated to the payload field
    pub fn data(bytes: impl Into<Bytes>) -> Self {
        let mut bytes = bytes.into();
        bytes.truncate(PAYLOAD_FIELD_LEN);
        Response::Success(bytes)
    }

    /// Success carrying `<ip>,<port>`
    pub fn addr(addr: SocketAddrV4) -> Self {
        let mut out = Vec::new();
        encode_addr(&mut out, &addr);
        Response::Success(Bytes::from(out))
    }

    /// Accept success: `<ip>,<port>,<session>`
    pub fn accepted(peer: SocketAddrV4, session: SessionId) -> Self {
        let mut out = Vec::new();
        encode_addr(&mut out, &peer);
        out.push(b',');
        out.extend_from_slice(session.to_string().as_bytes());
        Response::Success(Bytes::from(out))
    }

    /// Receive-from success: `<ip>,<port>,<bytes>`
    ///
    /// Bytes that do not fit behind the address prefix are never cut: the
    /// response becomes an `EMSGSIZE` rejection instead. Up to
    /// [`MAX_DATAGRAM_LEN`] bytes always fit.
    ///
    /// [`MAX_DATAGRAM_LEN`]: crate::protocol::frame::MAX_DATAGRAM_LEN
    pub fn datagram(source: SocketAddrV4, bytes: &[u8]) -> Self {
        let mut out = Vec::with_capacity(PAYLOAD_FIELD_LEN);
        encode_addr(&mut out, &source);
        out.push(b',');
        if out.len() + bytes.len() > PAYLOAD_FIELD_LEN {
            return Response::error(libc::EMSGSIZE);
        }
        out.extend_from_slice(bytes);
        Response::Success(Bytes::from(out))
    }

    /// Rejection; a non-positive errno is reported as `EIO`
    pub fn error(errno: i32) -> Self {
        Response::Rejected(if errno > 0 { errno } else { libc::EIO })
    }

    pub fn encode(&self) -> ResponseFrame {
        match self {
            Response::Success(payload) => {
                let len = payload.len().min(PAYLOAD_FIELD_LEN);
                ResponseFrame::new(len as i32, &payload[..len])
            }
            Response::Rejected(errno) => ResponseFrame::new(-errno.saturating_abs(), &[]),
        }
    }

    pub fn decode(frame: &ResponseFrame) -> Result<Self> {
        let status = frame.status();
        if status < 0 {
            let errno = status.checked_neg().ok_or_else(|| {
                InterposeError::MalformedFrame(format!("status {} out of range", status))
            })?;
            return Ok(Response::Rejected(errno));
        }

        let len = status as usize;
        if len > PAYLOAD_FIELD_LEN {
            return Err(InterposeError::MalformedFrame(format!(
                "declared payload of {} bytes exceeds the {} byte field",
                len, PAYLOAD_FIELD_LEN
            )));
        }
        Ok(Response::Success(frame.payload_field().slice(..len)))
    }

    /// Success payload, or the rejection as [`InterposeError::MediatorRejected`]
    pub fn into_result(self, call: Call) -> Result<Bytes> {
        match self {
            Response::Success(payload) => Ok(payload),
            Response::Rejected(errno) => Err(InterposeError::MediatorRejected {
                call: call.name(),
                errno,
            }),
        }
    }
}

/// Parse a decimal integer payload
pub fn parse_int(payload: &[u8], call: Call) -> Result<i64> {
    let mut r = FieldReader::new(payload, call.name());
    let value = r.number(false)?;
    r.finish()?;
    Ok(value)
}

/// Parse an `<ip>,<port>` payload
pub fn parse_addr(payload: &[u8], call: Call) -> Result<SocketAddrV4> {
    let mut r = FieldReader::new(payload, call.name());
    let addr = r.addr(false)?;
    r.finish()?;
    Ok(addr)
}

/// Parse an accept payload: peer address and the new remote session
pub fn parse_accepted(payload: &[u8]) -> Result<(SocketAddrV4, SessionId)> {
    let mut r = FieldReader::new(payload, "accept");
    let peer = r.addr(true)?;
    let session = r.number(false)?;
    r.finish()?;
    Ok((peer, session))
}

/// Parse a receive-from payload: source address and the delivered bytes
pub fn parse_datagram(payload: &Bytes) -> Result<(SocketAddrV4, Bytes)> {
    let mut r = FieldReader::new(payload, "recvfrom");
    let source = r.addr(true)?;
    let offset = payload.len() - r.remainder().len();
    Ok((source, payload.slice(offset..)))
}
