// src/listener/processor.rs
//! Call processor contract for the mediator side
//!
//! A mediator implements the calls it understands. Every call it leaves out
//! answers `ENOSYS`, so a partial mediator is still well formed on the wire.

use crate::protocol::{Call, Request, Response, SessionId};
use bytes::Bytes;
use std::net::SocketAddrV4;
use tracing::debug;

fn not_implemented(call: Call) -> Response {
    debug!("No handler for {}, answering ENOSYS", call);
    Response::error(libc::ENOSYS)
}

/// Executes decoded calls against the mediator's network model
///
/// Methods run on a blocking thread pool, one call at a time per channel;
/// calls from different channels may run concurrently.
pub trait CallProcessor: Send + Sync + 'static {
    /// Create a session; success carries the new session id
    fn socket(&self, _domain: i32, _socket_type: i32, _protocol: i32) -> Response {
        not_implemented(Call::Socket)
    }

    fn bind(&self, _session: SessionId, _addr: SocketAddrV4) -> Response {
        not_implemented(Call::Bind)
    }

    fn connect(&self, _session: SessionId, _addr: SocketAddrV4) -> Response {
        not_implemented(Call::Connect)
    }

    fn listen(&self, _session: SessionId, _backlog: i32) -> Response {
        not_implemented(Call::Listen)
    }

    /// Success carries `<ip>,<port>,<session>`, see [`Response::accepted`]
    fn accept(&self, _session: SessionId) -> Response {
        not_implemented(Call::Accept)
    }

    /// Success carries the number of bytes taken
    fn send(&self, _session: SessionId, _flags: i32, _payload: Bytes) -> Response {
        not_implemented(Call::Send)
    }

    fn sendto(
        &self,
        _session: SessionId,
        _flags: i32,
        _addr: SocketAddrV4,
        _payload: Bytes,
    ) -> Response {
        not_implemented(Call::SendTo)
    }

    /// Success carries at most `len` raw bytes
    fn recv(&self, _session: SessionId, _len: usize, _flags: i32) -> Response {
        not_implemented(Call::Recv)
    }

    /// Success carries the source and the bytes, see [`Response::datagram`]
    ///
    /// The interposer never asks for more than [`MAX_DATAGRAM_LEN`] bytes,
    /// so a reply built from at most `len` bytes always fits the payload
    /// field.
    ///
    /// [`MAX_DATAGRAM_LEN`]: crate::protocol::frame::MAX_DATAGRAM_LEN
    fn recvfrom(&self, _session: SessionId, _len: usize, _flags: i32) -> Response {
        not_implemented(Call::RecvFrom)
    }

    fn close(&self, _session: SessionId) -> Response {
        not_implemented(Call::Close)
    }

    fn shutdown(&self, _session: SessionId, _how: i32) -> Response {
        not_implemented(Call::Shutdown)
    }

    fn getsockopt(&self, _session: SessionId, _level: i32, _option: i32) -> Response {
        not_implemented(Call::GetSockOpt)
    }

    fn setsockopt(&self, _session: SessionId, _level: i32, _option: i32, _value: i32) -> Response {
        not_implemented(Call::SetSockOpt)
    }

    fn getpeername(&self, _session: SessionId) -> Response {
        not_implemented(Call::GetPeerName)
    }

    fn getsockname(&self, _session: SessionId) -> Response {
        not_implemented(Call::GetSockName)
    }

    /// Route a request to its handler
    fn process(&self, request: Request) -> Response {
        match request {
            Request::Socket {
                domain,
                socket_type,
                protocol,
            } => self.socket(domain, socket_type, protocol),
            Request::Bind { session, addr } => self.bind(session, addr),
            Request::Connect { session, addr } => self.connect(session, addr),
            Request::Listen { session, backlog } => self.listen(session, backlog),
            Request::Accept { session } => self.accept(session),
            Request::Send {
                session,
                flags,
                payload,
            } => self.send(session, flags, payload),
            Request::SendTo {
                session,
                flags,
                addr,
                payload,
            } => self.sendto(session, flags, addr, payload),
            Request::Recv {
                session,
                len,
                flags,
            } => self.recv(session, len, flags),
            Request::RecvFrom {
                session,
                len,
                flags,
            } => self.recvfrom(session, len, flags),
            Request::Close { session } => self.close(session),
            Request::Shutdown { session, how } => self.shutdown(session, how),
            Request::GetSockOpt {
                session,
                level,
                option,
            } => self.getsockopt(session, level, option),
            Request::SetSockOpt {
                session,
                level,
                option,
                value,
            } => self.setsockopt(session, level, option, value),
            Request::GetPeerName { session } => self.getpeername(session),
            Request::GetSockName { session } => self.getsockname(session),
        }
    }
}
