// src/interception/interposer.rs
//! Call interceptors
//!
//! One method per intercepted socket call. Each method resolves the local
//! handle to its session, checks the call against the socket state, runs one
//! roundtrip on the session's channel and converts the response into the
//! native result shape.
//!
//! `socket` and `accept` create sessions, each with its own new channel.
//! `close` tears a session down, falling back to the genuine OS close for
//! descriptors the interposer does not own.

use crate::interception::channel::ChannelManager;
use crate::interception::resolver::NativeSocketApi;
use crate::interception::session_registry::{
    LocalHandle, Session, SessionInner, SessionRegistry, SocketState,
};
use crate::protocol::frame::{MAX_DATAGRAM_LEN, PAYLOAD_FIELD_LEN};
use crate::protocol::response::{parse_accepted, parse_addr, parse_datagram, parse_int};
use crate::protocol::{Call, Request, Response, SessionId};
use crate::utils::config::InterposerConfig;
use crate::utils::errors::{InterposeError, Result};
use bytes::Bytes;
use std::net::SocketAddrV4;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Metric: calls the mediator rejected, labelled by call
pub const REJECTIONS_TOTAL: &str = "netinterpose_rejections_total";

/// Routes intercepted socket calls to the mediator
pub struct Interposer {
    registry: SessionRegistry,
    channels: ChannelManager,
    native: Arc<dyn NativeSocketApi>,
}

impl Interposer {
    pub fn new(config: &InterposerConfig, native: Arc<dyn NativeSocketApi>) -> Result<Self> {
        config.validate()?;

        let channels = ChannelManager::new(
            config.mediator.endpoint(),
            config.mediator.roundtrip_timeout(),
            native.clone(),
        );
        let registry = SessionRegistry::new(config.sessions.max_sessions);
        info!(
            "Interposer routing sockets to mediator at {} (max {} sessions)",
            channels.endpoint(),
            registry.max_sessions()
        );

        Ok(Self {
            registry,
            channels,
            native,
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Create a socket: opens a channel and asks the mediator for a session
    pub fn socket(&self, domain: i32, socket_type: i32, protocol: i32) -> Result<LocalHandle> {
        let slot = self.registry.reserve()?;
        let mut channel = self.channels.open()?;

        let request = Request::Socket {
            domain,
            socket_type,
            protocol,
        };
        let frame = self.channels.roundtrip(&mut channel, &request.encode())?;
        let payload = self.outcome(Call::Socket, Response::decode(&frame)?)?;
        let remote = session_id(parse_int(&payload, Call::Socket)?, Call::Socket)?;

        let session = self
            .registry
            .register(slot, Session::new(remote, channel, SocketState::Created))?;
        debug!(
            "socket({}, {}, {}) -> handle {} (session {})",
            domain,
            socket_type,
            protocol,
            session.local(),
            remote
        );
        Ok(session.local())
    }

    pub fn bind(&self, handle: LocalHandle, addr: SocketAddrV4) -> Result<()> {
        self.forward(
            handle,
            Call::Bind,
            |session| Request::Bind { session, addr },
            |_, payload| parse_int(&payload, Call::Bind).map(drop),
        )
    }

    pub fn listen(&self, handle: LocalHandle, backlog: i32) -> Result<()> {
        self.forward(
            handle,
            Call::Listen,
            |session| Request::Listen { session, backlog },
            |_, payload| parse_int(&payload, Call::Listen).map(drop),
        )
    }

    pub fn connect(&self, handle: LocalHandle, addr: SocketAddrV4) -> Result<()> {
        self.forward(
            handle,
            Call::Connect,
            |session| Request::Connect { session, addr },
            |_, payload| parse_int(&payload, Call::Connect).map(drop),
        )
    }

    /// Accept one pending connection as a new handle with its own channel
    pub fn accept(&self, handle: LocalHandle) -> Result<(LocalHandle, SocketAddrV4)> {
        let slot = self.registry.reserve()?;
        let (peer, remote) = self.forward(
            handle,
            Call::Accept,
            |session| Request::Accept { session },
            |_, payload| parse_accepted(&payload),
        )?;

        let channel = self.channels.open()?;
        let session = self
            .registry
            .register(slot, Session::new(remote, channel, SocketState::Connected))?;
        debug!(
            "accept({}) -> handle {} (session {}) from {}",
            handle,
            session.local(),
            remote,
            peer
        );
        Ok((session.local(), peer))
    }

    /// Send bytes; a payload larger than one frame is sent short
    pub fn send(&self, handle: LocalHandle, data: &[u8], flags: i32) -> Result<usize> {
        let payload = Bytes::copy_from_slice(data);
        self.forward(
            handle,
            Call::Send,
            |session| Request::Send {
                session,
                flags,
                payload,
            },
            |request, reply| byte_count(&reply, Call::Send, request.carried_payload()),
        )
    }

    pub fn send_to(
        &self,
        handle: LocalHandle,
        data: &[u8],
        flags: i32,
        addr: SocketAddrV4,
    ) -> Result<usize> {
        let payload = Bytes::copy_from_slice(data);
        self.forward(
            handle,
            Call::SendTo,
            |session| Request::SendTo {
                session,
                flags,
                addr,
                payload,
            },
            |request, reply| byte_count(&reply, Call::SendTo, request.carried_payload()),
        )
    }

    /// Receive into `buf`; returns the number of bytes copied
    pub fn recv(&self, handle: LocalHandle, buf: &mut [u8], flags: i32) -> Result<usize> {
        let len = buf.len().min(PAYLOAD_FIELD_LEN);
        let data = self.forward(
            handle,
            Call::Recv,
            |session| Request::Recv {
                session,
                len,
                flags,
            },
            |_, data| Ok(data),
        )?;
        Ok(copy_into(buf, &data))
    }

    /// Receive into `buf`, also reporting the source address
    ///
    /// The source address shares the payload field with the data, so at most
    /// [`MAX_DATAGRAM_LEN`] bytes are asked for.
    pub fn recv_from(
        &self,
        handle: LocalHandle,
        buf: &mut [u8],
        flags: i32,
    ) -> Result<(usize, SocketAddrV4)> {
        let len = buf.len().min(MAX_DATAGRAM_LEN);
        let (source, data) = self.forward(
            handle,
            Call::RecvFrom,
            |session| Request::RecvFrom {
                session,
                len,
                flags,
            },
            |_, payload| parse_datagram(&payload),
        )?;
        Ok((copy_into(buf, &data), source))
    }

    pub fn shutdown(&self, handle: LocalHandle, how: i32) -> Result<()> {
        self.forward(
            handle,
            Call::Shutdown,
            |session| Request::Shutdown { session, how },
            |_, payload| parse_int(&payload, Call::Shutdown).map(drop),
        )
    }

    pub fn getsockopt(&self, handle: LocalHandle, level: i32, option: i32) -> Result<i32> {
        self.forward(
            handle,
            Call::GetSockOpt,
            |session| Request::GetSockOpt {
                session,
                level,
                option,
            },
            |_, payload| int_value(&payload, Call::GetSockOpt),
        )
    }

    pub fn setsockopt(&self, handle: LocalHandle, level: i32, option: i32, value: i32) -> Result<()> {
        self.forward(
            handle,
            Call::SetSockOpt,
            |session| Request::SetSockOpt {
                session,
                level,
                option,
                value,
            },
            |_, payload| parse_int(&payload, Call::SetSockOpt).map(drop),
        )
    }

    pub fn peer_addr(&self, handle: LocalHandle) -> Result<SocketAddrV4> {
        self.forward(
            handle,
            Call::GetPeerName,
            |session| Request::GetPeerName { session },
            |_, payload| parse_addr(&payload, Call::GetPeerName),
        )
    }

    pub fn local_addr(&self, handle: LocalHandle) -> Result<SocketAddrV4> {
        self.forward(
            handle,
            Call::GetSockName,
            |session| Request::GetSockName { session },
            |_, payload| parse_addr(&payload, Call::GetSockName),
        )
    }

    /// Close a handle
    ///
    /// Descriptors without a session go to the genuine OS close. A session
    /// the mediator no longer knows (EBADF) is still released locally, as is
    /// one whose channel broke during the close.
    pub fn close(&self, handle: LocalHandle) -> Result<()> {
        let session = match self.registry.lookup(handle) {
            Ok(session) => session,
            Err(InterposeError::UnknownHandle(_)) => return self.close_native(handle),
            Err(e) => return Err(e),
        };

        let mut inner = session.lock();
        inner.state.check(Call::Close, handle)?;

        let request = Request::Close {
            session: session.remote(),
        };
        let outcome = self
            .channels
            .roundtrip(&mut inner.channel, &request.encode())
            .and_then(|frame| Response::decode(&frame))
            .and_then(|response| self.outcome(Call::Close, response))
            .and_then(|payload| parse_int(&payload, Call::Close));

        match outcome {
            Ok(_) => {
                self.release(&session, &mut inner)?;
                debug!("close({}) released session {}", handle, session.remote());
                Ok(())
            }
            Err(InterposeError::MediatorRejected { errno, .. }) if errno == libc::EBADF => {
                debug!(
                    "Mediator does not know session {}, releasing handle {} locally",
                    session.remote(),
                    handle
                );
                self.release(&session, &mut inner)
            }
            Err(e) if e.is_transport_failure() => {
                if let Err(release_err) = self.release(&session, &mut inner) {
                    warn!(
                        "Releasing handle {} failed: {} ({})",
                        handle,
                        release_err,
                        release_err.errno_desc()
                    );
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Close every live session; used at teardown
    pub fn close_all(&self) {
        for handle in self.registry.handles() {
            if let Err(e) = self.close(handle) {
                warn!("Closing handle {} failed: {} ({})", handle, e, e.errno_desc());
            }
        }
    }

    fn close_native(&self, handle: LocalHandle) -> Result<()> {
        self.native.close(handle).map_err(|e| {
            if e.raw_os_error() == Some(libc::EBADF) {
                InterposeError::UnknownHandle(handle)
            } else {
                InterposeError::Native(e)
            }
        })
    }

    /// Forget the session, then close its channel
    fn release(&self, session: &Session, inner: &mut SessionInner) -> Result<()> {
        inner.state = SocketState::Closed;
        // Unregister first: the descriptor number may be reused as soon as
        // it is closed.
        self.registry.remove(session.local())?;
        inner.channel.release()?;
        Ok(())
    }

    /// Run one call on an existing session
    ///
    /// The state transition is applied only after the payload parsed, so a
    /// malformed success leaves the socket where it was.
    fn forward<T>(
        &self,
        handle: LocalHandle,
        call: Call,
        build: impl FnOnce(SessionId) -> Request,
        parse: impl FnOnce(&Request, Bytes) -> Result<T>,
    ) -> Result<T> {
        let session = self.registry.lookup(handle)?;
        let mut inner = session.lock();
        inner.state.check(call, handle)?;

        let request = build(session.remote());
        let frame = self.channels.roundtrip(&mut inner.channel, &request.encode())?;
        let payload = self.outcome(call, Response::decode(&frame)?)?;
        let value = parse(&request, payload)?;

        inner.state = inner.state.after(call);
        Ok(value)
    }

    fn outcome(&self, call: Call, response: Response) -> Result<Bytes> {
        response.into_result(call).map_err(|e| {
            if let InterposeError::MediatorRejected { errno, .. } = &e {
                metrics::counter!(REJECTIONS_TOTAL, "call" => call.name()).increment(1);
                debug!("Mediator rejected {}: errno {} ({})", call, errno, e.errno_desc());
            }
            e
        })
    }
}

fn session_id(value: i64, call: Call) -> Result<SessionId> {
    SessionId::try_from(value).map_err(|_| {
        InterposeError::MalformedFrame(format!("{}: session id {} out of range", call, value))
    })
}

fn int_value(payload: &[u8], call: Call) -> Result<i32> {
    let value = parse_int(payload, call)?;
    i32::try_from(value)
        .map_err(|_| InterposeError::MalformedFrame(format!("{}: {} out of range", call, value)))
}

/// Byte count acknowledged by the mediator; never more than the frame carried
fn byte_count(payload: &[u8], call: Call, carried: usize) -> Result<usize> {
    let accepted = parse_int(payload, call)?;
    usize::try_from(accepted)
        .ok()
        .filter(|&n| n <= carried)
        .ok_or_else(|| {
            InterposeError::MalformedFrame(format!(
                "{}: mediator accepted {} of {} carried bytes",
                call, accepted, carried
            ))
        })
}

fn copy_into(buf: &mut [u8], data: &[u8]) -> usize {
    let n = data.len().min(buf.len());
    buf[..n].copy_from_slice(&data[..n]);
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interception::resolver::LibcSocketApi;
    use crate::listener::{BackgroundListener, CallProcessor};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::net::SocketAddr;

    /// Single-peer loopback mediator: whatever one session sends, any
    /// session receives.
    #[derive(Default)]
    struct Loopback {
        next_session: Mutex<SessionId>,
        buffered: Mutex<Vec<u8>>,
        options: Mutex<HashMap<(SessionId, i32, i32), i32>>,
        closed: Mutex<Vec<SessionId>>,
    }

    impl CallProcessor for Loopback {
        fn socket(&self, _domain: i32, _socket_type: i32, _protocol: i32) -> Response {
            let mut next = self.next_session.lock();
            *next += 1;
            Response::int(i64::from(*next + 100))
        }

        fn bind(&self, _session: SessionId, addr: SocketAddrV4) -> Response {
            if addr.port() == 1 {
                Response::error(libc::EACCES)
            } else {
                Response::int(0)
            }
        }

        fn listen(&self, _session: SessionId, _backlog: i32) -> Response {
            Response::int(0)
        }

        fn accept(&self, _session: SessionId) -> Response {
            Response::accepted("10.0.0.2:40000".parse().unwrap(), 900)
        }

        fn connect(&self, _session: SessionId, _addr: SocketAddrV4) -> Response {
            Response::int(0)
        }

        fn send(&self, _session: SessionId, _flags: i32, payload: Bytes) -> Response {
            self.buffered.lock().extend_from_slice(&payload);
            Response::int(payload.len() as i64)
        }

        fn recv(&self, _session: SessionId, len: usize, _flags: i32) -> Response {
            let mut buffered = self.buffered.lock();
            let n = len.min(buffered.len());
            let out: Vec<u8> = buffered.drain(..n).collect();
            Response::data(out)
        }

        fn close(&self, session: SessionId) -> Response {
            self.closed.lock().push(session);
            if session == 900 {
                Response::error(libc::EBADF)
            } else {
                Response::int(0)
            }
        }

        fn getsockopt(&self, session: SessionId, level: i32, option: i32) -> Response {
            let value = self.options.lock().get(&(session, level, option)).copied();
            Response::int(i64::from(value.unwrap_or(0)))
        }

        fn setsockopt(&self, session: SessionId, level: i32, option: i32, value: i32) -> Response {
            self.options.lock().insert((session, level, option), value);
            Response::int(0)
        }

        fn getpeername(&self, _session: SessionId) -> Response {
            Response::addr("10.0.0.2:40000".parse().unwrap())
        }
    }

    /// Answers bind with a non-numeric payload and claims every send took
    /// 10000 bytes.
    struct Garbled;

    impl CallProcessor for Garbled {
        fn socket(&self, _domain: i32, _socket_type: i32, _protocol: i32) -> Response {
            Response::int(7)
        }

        fn bind(&self, _session: SessionId, _addr: SocketAddrV4) -> Response {
            Response::data(Bytes::from_static(b"abc"))
        }

        fn connect(&self, _session: SessionId, _addr: SocketAddrV4) -> Response {
            Response::int(0)
        }

        fn send(&self, _session: SessionId, _flags: i32, _payload: Bytes) -> Response {
            Response::int(10_000)
        }
    }

    fn start(processor: Arc<dyn CallProcessor>) -> (BackgroundListener, Interposer) {
        let listener =
            BackgroundListener::spawn("127.0.0.1:0".parse().unwrap(), processor).unwrap();
        let port = match listener.local_addr() {
            SocketAddr::V4(addr) => addr.port(),
            other => panic!("unexpected {}", other),
        };

        let mut config = InterposerConfig::default();
        config.mediator.port = port;
        config.mediator.roundtrip_timeout_ms = Some(5_000);
        config.sessions.max_sessions = 4;
        let interposer = Interposer::new(&config, Arc::new(LibcSocketApi::linked())).unwrap();
        (listener, interposer)
    }

    #[test]
    fn test_socket_registers_channel_handle() {
        let (_listener, interposer) = start(Arc::new(Loopback::default()));

        let a = interposer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        let b = interposer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        assert_ne!(a, b);

        let registry = interposer.registry();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup(a).unwrap().remote(), 101);
        assert_eq!(registry.lookup(b).unwrap().remote(), 102);
        assert_eq!(registry.lookup(a).unwrap().state(), SocketState::Created);
    }

    #[test]
    fn test_connected_send_recv() {
        let (_listener, interposer) = start(Arc::new(Loopback::default()));
        let handle = interposer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();

        interposer
            .connect(handle, "127.0.0.1:9000".parse().unwrap())
            .unwrap();
        assert_eq!(interposer.send(handle, b"a,b\0c", 0).unwrap(), 5);

        let mut buf = [0u8; 3];
        assert_eq!(interposer.recv(handle, &mut buf, 0).unwrap(), 3);
        assert_eq!(&buf, b"a,b");
        let mut buf = [0u8; 16];
        assert_eq!(interposer.recv(handle, &mut buf, 0).unwrap(), 2);
        assert_eq!(&buf[..2], b"\0c");

        assert_eq!(
            interposer.peer_addr(handle).unwrap(),
            "10.0.0.2:40000".parse().unwrap()
        );
    }

    #[test]
    fn test_mediator_rejection_keeps_state() {
        let (_listener, interposer) = start(Arc::new(Loopback::default()));
        let handle = interposer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();

        let err = interposer
            .bind(handle, "0.0.0.0:1".parse().unwrap())
            .unwrap_err();
        assert_eq!(err.errno(), libc::EACCES);
        assert!(err.is_mediator_rejection());

        let session = interposer.registry().lookup(handle).unwrap();
        assert_eq!(session.state(), SocketState::Created);

        interposer
            .bind(handle, "0.0.0.0:9000".parse().unwrap())
            .unwrap();
        assert_eq!(session.state(), SocketState::Bound);
    }

    #[test]
    fn test_malformed_success_is_not_a_result() {
        let (_listener, interposer) = start(Arc::new(Garbled));
        let handle = interposer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();

        let err = interposer
            .bind(handle, "0.0.0.0:9000".parse().unwrap())
            .unwrap_err();
        assert!(matches!(err, InterposeError::MalformedFrame(_)), "{}", err);
        assert_eq!(err.errno(), libc::EPROTO);
        let session = interposer.registry().lookup(handle).unwrap();
        assert_eq!(session.state(), SocketState::Created);

        interposer
            .connect(handle, "127.0.0.1:9000".parse().unwrap())
            .unwrap();
        assert_eq!(session.state(), SocketState::Connected);
    }

    #[test]
    fn test_send_count_bounded_by_carried_bytes() {
        let (_listener, interposer) = start(Arc::new(Garbled));
        let handle = interposer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        interposer
            .connect(handle, "127.0.0.1:9000".parse().unwrap())
            .unwrap();

        // The frame carries about 2 KiB of the 10000 offered bytes.
        let err = interposer.send(handle, &[b'x'; 10_000], 0).unwrap_err();
        assert!(matches!(err, InterposeError::MalformedFrame(_)), "{}", err);
        let err = interposer.send(handle, b"hello", 0).unwrap_err();
        assert!(matches!(err, InterposeError::MalformedFrame(_)), "{}", err);
        assert!(interposer.registry().contains(handle));
    }

    #[test]
    fn test_state_violation_is_rejected_locally() {
        let (_listener, interposer) = start(Arc::new(Loopback::default()));
        let handle = interposer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();

        let err = interposer.send(handle, b"early", 0).unwrap_err();
        assert_eq!(err.errno(), libc::ENOTCONN);
        let err = interposer.accept(handle).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
        let err = interposer.listen(handle, 5).unwrap_err();
        assert!(matches!(err, InterposeError::InvalidState { .. }));
    }

    #[test]
    fn test_accept_opens_distinct_handle() {
        let processor = Arc::new(Loopback::default());
        let (_listener, interposer) = start(processor.clone());
        let handle = interposer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        interposer
            .bind(handle, "0.0.0.0:9000".parse().unwrap())
            .unwrap();
        interposer.listen(handle, 5).unwrap();

        let (accepted, peer) = interposer.accept(handle).unwrap();
        assert_ne!(accepted, handle);
        assert_eq!(peer, "10.0.0.2:40000".parse().unwrap());

        let session = interposer.registry().lookup(accepted).unwrap();
        assert_eq!(session.remote(), 900);
        assert_eq!(session.state(), SocketState::Connected);

        // The mediator answers EBADF for 900; the handle is still released.
        interposer.close(accepted).unwrap();
        assert!(!interposer.registry().contains(accepted));
        assert_eq!(processor.closed.lock().as_slice(), &[900]);
    }

    #[test]
    fn test_close_unknown_handle() {
        let (_listener, interposer) = start(Arc::new(Loopback::default()));

        // A descriptor the interposer never saw goes to the OS close.
        let file = tempfile::tempfile().unwrap();
        let fd = std::os::unix::io::IntoRawFd::into_raw_fd(file);
        interposer.close(fd).unwrap();

        let err = interposer.close(-1).unwrap_err();
        assert!(matches!(err, InterposeError::UnknownHandle(-1)));
        assert!(matches!(
            interposer.send(-1, b"x", 0),
            Err(InterposeError::UnknownHandle(-1))
        ));
    }

    #[test]
    fn test_close_removes_session() {
        let processor = Arc::new(Loopback::default());
        let (_listener, interposer) = start(processor.clone());
        let handle = interposer.socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();

        interposer.close(handle).unwrap();
        assert!(interposer.registry().is_empty());
        assert_eq!(processor.closed.lock().as_slice(), &[101]);
        assert!(matches!(
            interposer.bind(handle, "0.0.0.0:53".parse().unwrap()),
            Err(InterposeError::UnknownHandle(_))
        ));
    }

    #[test]
    fn test_socket_options() {
        let (_listener, interposer) = start(Arc::new(Loopback::default()));
        let handle = interposer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();

        assert_eq!(
            interposer
                .getsockopt(handle, libc::SOL_SOCKET, libc::SO_REUSEADDR)
                .unwrap(),
            0
        );
        interposer
            .setsockopt(handle, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
            .unwrap();
        assert_eq!(
            interposer
                .getsockopt(handle, libc::SOL_SOCKET, libc::SO_REUSEADDR)
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_session_limit_counts_live_handles() {
        let (_listener, interposer) = start(Arc::new(Loopback::default()));
        let handles: Vec<_> = (0..4)
            .map(|_| interposer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap())
            .collect();

        let err = interposer
            .socket(libc::AF_INET, libc::SOCK_STREAM, 0)
            .unwrap_err();
        assert_eq!(err.errno(), libc::EMFILE);

        interposer.close(handles[0]).unwrap();
        interposer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    }

    #[test]
    fn test_lost_mediator_is_transport_failure() {
        let (listener, interposer) = start(Arc::new(Loopback::default()));
        let handle = interposer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        listener.shutdown();

        let err = interposer
            .bind(handle, "0.0.0.0:9000".parse().unwrap())
            .unwrap_err();
        assert!(err.is_transport_failure());

        let err = interposer
            .connect(handle, "127.0.0.1:80".parse().unwrap())
            .unwrap_err();
        assert!(err.is_transport_failure());

        // Closing a broken session still frees it.
        assert!(interposer.close(handle).is_err());
        assert!(interposer.registry().is_empty());

        let err = interposer
            .socket(libc::AF_INET, libc::SOCK_STREAM, 0)
            .unwrap_err();
        assert!(matches!(err, InterposeError::ChannelOpen(_)));
    }

    #[test]
    fn test_close_all() {
        let (_listener, interposer) = start(Arc::new(Loopback::default()));
        for _ in 0..3 {
            interposer.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        }
        interposer.close_all();
        assert!(interposer.registry().is_empty());
    }
}
