// src/protocol/request.rs
//! Typed requests and their per-call frame schemas
//!
//! Every call has a fixed number of textual fields. Calls that carry a byte
//! payload (send, sendto) put it after the last textual field, and one of
//! those fields declares its length, so the payload is located by counting
//! delimiters in the textual prefix and then read verbatim.

use crate::protocol::frame::{encode_addr, trim_padding, FieldReader, RequestFrame};
use crate::protocol::frame::{ARG_FIELD_LEN, DELIMITER};
use crate::protocol::SessionId;
use crate::utils::errors::{InterposeError, Result};
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddrV4;

/// Intercepted socket calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    Socket,
    Bind,
    Connect,
    Listen,
    Accept,
    Send,
    SendTo,
    Recv,
    RecvFrom,
    Close,
    Shutdown,
    GetSockOpt,
    SetSockOpt,
    GetPeerName,
    GetSockName,
}

impl Call {
    pub const ALL: [Call; 15] = [
        Call::Socket,
        Call::Bind,
        Call::Connect,
        Call::Listen,
        Call::Accept,
        Call::Send,
        Call::SendTo,
        Call::Recv,
        Call::RecvFrom,
        Call::Close,
        Call::Shutdown,
        Call::GetSockOpt,
        Call::SetSockOpt,
        Call::GetPeerName,
        Call::GetSockName,
    ];

    /// Wire name of the call
    pub fn name(&self) -> &'static str {
        match self {
            Call::Socket => "socket",
            Call::Bind => "bind",
            Call::Connect => "connect",
            Call::Listen => "listen",
            Call::Accept => "accept",
            Call::Send => "send",
            Call::SendTo => "sendto",
            Call::Recv => "recv",
            Call::RecvFrom => "recvfrom",
            Call::Close => "close",
            Call::Shutdown => "shutdown",
            Call::GetSockOpt => "getsockopt",
            Call::SetSockOpt => "setsockopt",
            Call::GetPeerName => "getpeername",
            Call::GetSockName => "getsockname",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|call| call.name() == name)
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A socket call as sent to the mediator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Socket {
        domain: i32,
        socket_type: i32,
        protocol: i32,
    },
    Bind {
        session: SessionId,
        addr: SocketAddrV4,
    },
    Connect {
        session: SessionId,
        addr: SocketAddrV4,
    },
    Listen {
        session: SessionId,
        backlog: i32,
    },
    Accept {
        session: SessionId,
    },
    Send {
        session: SessionId,
        flags: i32,
        payload: Bytes,
    },
    SendTo {
        session: SessionId,
        flags: i32,
        addr: SocketAddrV4,
        payload: Bytes,
    },
    Recv {
        session: SessionId,
        len: usize,
        flags: i32,
    },
    RecvFrom {
        session: SessionId,
        len: usize,
        flags: i32,
    },
    Close {
        session: SessionId,
    },
    Shutdown {
        session: SessionId,
        how: i32,
    },
    GetSockOpt {
        session: SessionId,
        level: i32,
        option: i32,
    },
    SetSockOpt {
        session: SessionId,
        level: i32,
        option: i32,
        value: i32,
    },
    GetPeerName {
        session: SessionId,
    },
    GetSockName {
        session: SessionId,
    },
}

struct ArgWriter {
    out: Vec<u8>,
}

impl ArgWriter {
    fn new() -> Self {
        Self {
            out: Vec::with_capacity(64),
        }
    }

    fn sep(&mut self) {
        if !self.out.is_empty() {
            self.out.push(DELIMITER);
        }
    }

    fn int(&mut self, value: impl fmt::Display) -> &mut Self {
        self.sep();
        self.out.extend_from_slice(value.to_string().as_bytes());
        self
    }

    fn addr(&mut self, addr: &SocketAddrV4) -> &mut Self {
        self.sep();
        encode_addr(&mut self.out, addr);
        self
    }

    /// Append `len,<payload>`, clamping the payload to what still fits in
    /// the argument field. The `len` field always matches the bytes written.
    fn payload(&mut self, payload: &[u8]) -> &mut Self {
        self.sep();
        let digits = payload.len().to_string().len();
        let room = ARG_FIELD_LEN.saturating_sub(self.out.len() + digits + 1);
        let carried = payload.len().min(room);
        self.out.extend_from_slice(carried.to_string().as_bytes());
        self.out.push(DELIMITER);
        self.out.extend_from_slice(&payload[..carried]);
        self
    }

    fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }
}

impl Request {
    pub fn call(&self) -> Call {
        match self {
            Request::Socket { .. } => Call::Socket,
            Request::Bind { .. } => Call::Bind,
            Request::Connect { .. } => Call::Connect,
            Request::Listen { .. } => Call::Listen,
            Request::Accept { .. } => Call::Accept,
            Request::Send { .. } => Call::Send,
            Request::SendTo { .. } => Call::SendTo,
            Request::Recv { .. } => Call::Recv,
            Request::RecvFrom { .. } => Call::RecvFrom,
            Request::Close { .. } => Call::Close,
            Request::Shutdown { .. } => Call::Shutdown,
            Request::GetSockOpt { .. } => Call::GetSockOpt,
            Request::SetSockOpt { .. } => Call::SetSockOpt,
            Request::GetPeerName { .. } => Call::GetPeerName,
            Request::GetSockName { .. } => Call::GetSockName,
        }
    }

    /// Session the request targets; `None` for socket creation
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Request::Socket { .. } => None,
            Request::Bind { session, .. }
            | Request::Connect { session, .. }
            | Request::Listen { session, .. }
            | Request::Accept { session }
            | Request::Send { session, .. }
            | Request::SendTo { session, .. }
            | Request::Recv { session, .. }
            | Request::RecvFrom { session, .. }
            | Request::Close { session }
            | Request::Shutdown { session, .. }
            | Request::GetSockOpt { session, .. }
            | Request::SetSockOpt { session, .. }
            | Request::GetPeerName { session }
            | Request::GetSockName { session } => Some(*session),
        }
    }

    /// Encode into a fixed-size frame. Payloads longer than the argument
    /// field can hold are truncated; see [`Request::carried_payload`].
    pub fn encode(&self) -> RequestFrame {
        let mut w = ArgWriter::new();
        match self {
            Request::Socket {
                domain,
                socket_type,
                protocol,
            } => w.int(domain).int(socket_type).int(protocol),
            Request::Bind { session, addr } | Request::Connect { session, addr } => {
                w.int(session).addr(addr)
            }
            Request::Listen { session, backlog } => w.int(session).int(backlog),
            Request::Accept { session }
            | Request::Close { session }
            | Request::GetPeerName { session }
            | Request::GetSockName { session } => w.int(session),
            Request::Send {
                session,
                flags,
                payload,
            } => w.int(session).int(flags).payload(payload),
            Request::SendTo {
                session,
                flags,
                addr,
                payload,
            } => w.int(session).int(flags).addr(addr).payload(payload),
            Request::Recv {
                session,
                len,
                flags,
            }
            | Request::RecvFrom {
                session,
                len,
                flags,
            } => w.int(session).int(len).int(flags),
            Request::Shutdown { session, how } => w.int(session).int(how),
            Request::GetSockOpt {
                session,
                level,
                option,
            } => w.int(session).int(level).int(option),
            Request::SetSockOpt {
                session,
                level,
                option,
                value,
            } => w.int(session).int(level).int(option).int(value),
        };
        RequestFrame::new(self.call().name(), &w.finish())
    }

    /// Number of payload bytes that [`Request::encode`] puts on the wire
    pub fn carried_payload(&self) -> usize {
        match self {
            Request::Send { .. } | Request::SendTo { .. } => {
                let frame = self.encode();
                let reader = FieldReader::new(frame.args(), "send");
                Self::payload_len_of(self.call(), reader).unwrap_or(0)
            }
            _ => 0,
        }
    }

    fn payload_len_of(call: Call, mut r: FieldReader<'_>) -> Result<usize> {
        r.number::<SessionId>(true)?;
        r.number::<i32>(true)?;
        if call == Call::SendTo {
            r.addr(true)?;
        }
        r.number(true)
    }

    /// Decode a frame read by the mediator side
    pub fn decode(frame: &RequestFrame) -> Result<Self> {
        let name = frame.call_name()?;
        let call = Call::from_name(name)
            .ok_or_else(|| InterposeError::MalformedFrame(format!("unknown call {:?}", name)))?;

        // Payload-carrying calls keep the raw field; the rest stop at the padding
        let args = match call {
            Call::Send | Call::SendTo => frame.args(),
            _ => trim_padding(frame.args()),
        };
        let mut r = FieldReader::new(args, call.name());

        let request = match call {
            Call::Socket => Request::Socket {
                domain: r.number(true)?,
                socket_type: r.number(true)?,
                protocol: r.number(false)?,
            },
            Call::Bind => Request::Bind {
                session: r.number(true)?,
                addr: r.addr(false)?,
            },
            Call::Connect => Request::Connect {
                session: r.number(true)?,
                addr: r.addr(false)?,
            },
            Call::Listen => Request::Listen {
                session: r.number(true)?,
                backlog: r.number(false)?,
            },
            Call::Accept => Request::Accept {
                session: r.number(false)?,
            },
            Call::Send => {
                let session = r.number(true)?;
                let flags = r.number(true)?;
                let len = r.number(true)?;
                let payload = Bytes::copy_from_slice(r.take(len)?);
                return Ok(Request::Send {
                    session,
                    flags,
                    payload,
                });
            }
            Call::SendTo => {
                let session = r.number(true)?;
                let flags = r.number(true)?;
                let addr = r.addr(true)?;
                let len = r.number(true)?;
                let payload = Bytes::copy_from_slice(r.take(len)?);
                return Ok(Request::SendTo {
                    session,
                    flags,
                    addr,
                    payload,
                });
            }
            Call::Recv => Request::Recv {
                session: r.number(true)?,
                len: r.number(true)?,
                flags: r.number(false)?,
            },
            Call::RecvFrom => Request::RecvFrom {
                session: r.number(true)?,
                len: r.number(true)?,
                flags: r.number(false)?,
            },
            Call::Close => Request::Close {
                session: r.number(false)?,
            },
            Call::Shutdown => Request::Shutdown {
                session: r.number(true)?,
                how: r.number(false)?,
            },
            Call::GetSockOpt => Request::GetSockOpt {
                session: r.number(true)?,
                level: r.number(true)?,
                option: r.number(false)?,
            },
            Call::SetSockOpt => Request::SetSockOpt {
                session: r.number(true)?,
                level: r.number(true)?,
                option: r.number(true)?,
                value: r.number(false)?,
            },
            Call::GetPeerName => Request::GetPeerName {
                session: r.number(false)?,
            },
            Call::GetSockName => Request::GetSockName {
                session: r.number(false)?,
            },
        };

        r.finish()?;
        Ok(request)
    }
}
