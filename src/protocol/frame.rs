// src/protocol/frame.rs
//! Fixed-size request and response frames
//!
//! ```text
//! request:  [ call name: 20 bytes, NUL padded ][ arguments: 2048 bytes, NUL padded ]
//! response: [ status: i32 little endian       ][ payload:   2048 bytes, NUL padded ]
//! ```
//!
//! Both frame lengths are constants known to each side, so no length prefix
//! is needed to delimit frames on the stream.

use crate::utils::errors::{InterposeError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

/// Width of the call-name field
pub const CALL_NAME_LEN: usize = 20;

/// Width of the argument field
pub const ARG_FIELD_LEN: usize = 2048;

/// Total request frame length
pub const REQUEST_FRAME_LEN: usize = CALL_NAME_LEN + ARG_FIELD_LEN;

/// Width of the status field
pub const STATUS_LEN: usize = 4;

/// Width of the response payload field
pub const PAYLOAD_FIELD_LEN: usize = 2048;

/// Total response frame length
pub const RESPONSE_FRAME_LEN: usize = STATUS_LEN + PAYLOAD_FIELD_LEN;

/// Separator between textual fields
pub const DELIMITER: u8 = b',';

/// Longest `<ip>,<port>,` prefix a receive-from payload can carry
/// (`255.255.255.255,65535,`)
pub const MAX_ADDR_PREFIX: usize = 22;

/// Data bytes a receive-from response can always carry after its prefix
pub const MAX_DATAGRAM_LEN: usize = PAYLOAD_FIELD_LEN - MAX_ADDR_PREFIX;

/// One request unit on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    buf: Bytes,
}

impl RequestFrame {
    /// Build a frame from a call name and an argument field. Both are
    /// truncated to their field widths and NUL padded.
    pub fn new(call_name: &str, args: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(REQUEST_FRAME_LEN);
        put_padded(&mut buf, call_name.as_bytes(), CALL_NAME_LEN);
        put_padded(&mut buf, args, ARG_FIELD_LEN);
        Self { buf: buf.freeze() }
    }

    /// Wrap bytes read off the wire
    pub fn from_bytes(buf: Bytes) -> Result<Self> {
        if buf.len() != REQUEST_FRAME_LEN {
            return Err(InterposeError::MalformedFrame(format!(
                "request frame is {} bytes, expected {}",
                buf.len(),
                REQUEST_FRAME_LEN
            )));
        }
        Ok(Self { buf })
    }

    /// Call name with the padding stripped
    pub fn call_name(&self) -> Result<&str> {
        let field = trim_padding(&self.buf[..CALL_NAME_LEN]);
        std::str::from_utf8(field)
            .map_err(|_| InterposeError::MalformedFrame("call name is not UTF-8".to_string()))
    }

    /// The whole argument field, padding included
    pub fn args(&self) -> &[u8] {
        &self.buf[CALL_NAME_LEN..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// One response unit on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    buf: Bytes,
}

impl ResponseFrame {
    /// Build a frame from a raw status and payload (truncated to the field width)
    pub fn new(status: i32, payload: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(RESPONSE_FRAME_LEN);
        buf.put_i32_le(status);
        put_padded(&mut buf, payload, PAYLOAD_FIELD_LEN);
        Self { buf: buf.freeze() }
    }

    /// Wrap bytes read off the wire
    pub fn from_bytes(buf: Bytes) -> Result<Self> {
        if buf.len() != RESPONSE_FRAME_LEN {
            return Err(InterposeError::MalformedFrame(format!(
                "response frame is {} bytes, expected {}",
                buf.len(),
                RESPONSE_FRAME_LEN
            )));
        }
        Ok(Self { buf })
    }

    pub fn status(&self) -> i32 {
        let mut raw = [0u8; STATUS_LEN];
        raw.copy_from_slice(&self.buf[..STATUS_LEN]);
        i32::from_le_bytes(raw)
    }

    /// The whole payload field, padding included
    pub fn payload_field(&self) -> Bytes {
        self.buf.slice(STATUS_LEN..)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

fn put_padded(buf: &mut BytesMut, data: &[u8], width: usize) {
    let len = data.len().min(width);
    buf.put_slice(&data[..len]);
    buf.put_bytes(0, width - len);
}

/// Strip trailing NUL padding from a textual field
pub(crate) fn trim_padding(field: &[u8]) -> &[u8] {
    match field.iter().position(|&b| b == 0) {
        Some(end) => &field[..end],
        None => field,
    }
}

/// Render an address as `<dotted-quad>,<port>`
pub fn encode_addr(out: &mut Vec<u8>, addr: &SocketAddrV4) {
    out.extend_from_slice(addr.ip().to_string().as_bytes());
    out.push(DELIMITER);
    out.extend_from_slice(addr.port().to_string().as_bytes());
}

/// Positional reader over delimited textual fields
///
/// Textual fields never contain the delimiter, so each one ends at the next
/// delimiter or at the end of the buffer. Anything after the last textual
/// field is taken verbatim with [`FieldReader::take`] or
/// [`FieldReader::remainder`], never scanned.
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8], context: &'static str) -> Self {
        Self {
            buf,
            pos: 0,
            context,
        }
    }

    fn malformed(&self, what: &str) -> InterposeError {
        InterposeError::MalformedFrame(format!("{}: {}", self.context, what))
    }

    /// Next field, terminated by a delimiter or the end of the buffer
    pub fn field(&mut self) -> Result<&'a str> {
        if self.pos >= self.buf.len() {
            return Err(self.malformed("missing field"));
        }
        let buf: &'a [u8] = self.buf;
        let rest = &buf[self.pos..];
        let (raw, consumed) = match rest.iter().position(|&b| b == DELIMITER) {
            Some(end) => (&rest[..end], end + 1),
            None => (rest, rest.len()),
        };
        self.pos += consumed;
        std::str::from_utf8(raw).map_err(|_| self.malformed("field is not UTF-8"))
    }

    /// Next field, which must be followed by a delimiter
    pub fn delimited(&mut self) -> Result<&'a str> {
        let buf: &'a [u8] = self.buf;
        let rest = &buf[self.pos.min(buf.len())..];
        let end = rest
            .iter()
            .position(|&b| b == DELIMITER)
            .ok_or_else(|| self.malformed("missing delimiter"))?;
        self.pos += end + 1;
        std::str::from_utf8(&rest[..end]).map_err(|_| self.malformed("field is not UTF-8"))
    }

    /// Parse a field (delimited or final) as a number
    pub fn number<T: FromStr>(&mut self, delimited: bool) -> Result<T> {
        let raw = if delimited {
            self.delimited()?
        } else {
            self.field()?
        };
        raw.parse()
            .map_err(|_| self.malformed(&format!("non-numeric field {:?}", raw)))
    }

    /// Parse `<ip>,<port>`; `delimited` requires a delimiter after the port
    pub fn addr(&mut self, delimited: bool) -> Result<SocketAddrV4> {
        let ip = self.delimited()?;
        let ip = Ipv4Addr::from_str(ip)
            .map_err(|_| self.malformed(&format!("bad address {:?}", ip)))?;
        let port: u16 = self.number(delimited)?;
        Ok(SocketAddrV4::new(ip, port))
    }

    /// Exactly `len` raw bytes
    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let available = self.buf.len().saturating_sub(self.pos);
        if len > available {
            return Err(self.malformed(&format!(
                "declared {} payload bytes but only {} remain",
                len, available
            )));
        }
        let buf: &'a [u8] = self.buf;
        let out = &buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Everything not consumed yet
    pub fn remainder(self) -> &'a [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }

    /// Fail if unread fields remain
    pub fn finish(self) -> Result<()> {
        if self.pos < self.buf.len() {
            return Err(self.malformed("unexpected trailing fields"));
        }
        Ok(())
    }
}
