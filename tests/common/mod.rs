// tests/common/mod.rs
//! Shared fixtures: an in-memory mediator and interposer setup

#![allow(dead_code)]

use bytes::Bytes;
use netinterpose::listener::{BackgroundListener, CallProcessor};
use netinterpose::protocol::{Request, Response, SessionId};
use netinterpose::{InterposerConfig, Interposer, LibcSocketApi};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

const FIRST_EPHEMERAL_PORT: u16 = 49152;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Stream,
    Datagram,
}

#[derive(Debug)]
struct VirtualSocket {
    kind: Kind,
    local: Option<SocketAddrV4>,
    peer: Option<SocketAddrV4>,
    peer_session: Option<SessionId>,
    listening: bool,
    pending: VecDeque<(SessionId, SocketAddrV4)>,
    stream_inbox: VecDeque<u8>,
    datagram_inbox: VecDeque<(SocketAddrV4, Vec<u8>)>,
    options: HashMap<(i32, i32), i32>,
}

impl VirtualSocket {
    fn new(kind: Kind) -> Self {
        Self {
            kind,
            local: None,
            peer: None,
            peer_session: None,
            listening: false,
            pending: VecDeque::new(),
            stream_inbox: VecDeque::new(),
            datagram_inbox: VecDeque::new(),
            options: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct NetState {
    next_session: SessionId,
    next_port: u16,
    sockets: HashMap<SessionId, VirtualSocket>,
}

impl NetState {
    fn ephemeral(&mut self) -> SocketAddrV4 {
        let port = self.next_port;
        self.next_port += 1;
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    fn port_in_use(&self, kind: Kind, port: u16) -> bool {
        self.sockets.values().any(|s| {
            s.kind == kind && s.peer_session.is_none() && s.local.map(|a| a.port()) == Some(port)
        })
    }

    fn find_bound(&self, kind: Kind, addr: SocketAddrV4, listening: bool) -> Option<SessionId> {
        self.sockets.iter().find_map(|(id, s)| {
            let local = s.local?;
            let ip_matches = local.ip().is_unspecified() || *local.ip() == *addr.ip();
            (s.kind == kind
                && s.listening == listening
                && s.peer_session.is_none()
                && local.port() == addr.port()
                && ip_matches)
                .then_some(*id)
        })
    }
}

/// Mediator simulating a loopback-only IPv4 network in memory
pub struct VirtualNetwork {
    state: Mutex<NetState>,
}

impl Default for VirtualNetwork {
    fn default() -> Self {
        Self {
            state: Mutex::new(NetState {
                next_session: 1,
                next_port: FIRST_EPHEMERAL_PORT,
                sockets: HashMap::new(),
            }),
        }
    }
}

impl VirtualNetwork {
    pub fn live_sessions(&self) -> usize {
        self.state.lock().sockets.len()
    }
}

impl CallProcessor for VirtualNetwork {
    fn socket(&self, domain: i32, socket_type: i32, _protocol: i32) -> Response {
        if domain != libc::AF_INET {
            return Response::error(libc::EAFNOSUPPORT);
        }
        let kind = match socket_type & 0xf {
            libc::SOCK_STREAM => Kind::Stream,
            libc::SOCK_DGRAM => Kind::Datagram,
            _ => return Response::error(libc::ESOCKTNOSUPPORT),
        };

        let mut state = self.state.lock();
        let id = state.next_session;
        state.next_session += 1;
        state.sockets.insert(id, VirtualSocket::new(kind));
        Response::int(i64::from(id))
    }

    fn bind(&self, session: SessionId, addr: SocketAddrV4) -> Response {
        let mut state = self.state.lock();
        let kind = match state.sockets.get(&session) {
            Some(socket) if socket.local.is_some() => return Response::error(libc::EINVAL),
            Some(socket) => socket.kind,
            None => return Response::error(libc::EBADF),
        };
        let local = if addr.port() == 0 {
            SocketAddrV4::new(*addr.ip(), state.ephemeral().port())
        } else if state.port_in_use(kind, addr.port()) {
            return Response::error(libc::EADDRINUSE);
        } else {
            addr
        };
        if let Some(socket) = state.sockets.get_mut(&session) {
            socket.local = Some(local);
        }
        Response::int(0)
    }

    fn listen(&self, session: SessionId, _backlog: i32) -> Response {
        let mut state = self.state.lock();
        match state.sockets.get_mut(&session) {
            Some(socket) if socket.kind == Kind::Stream && socket.local.is_some() => {
                socket.listening = true;
                Response::int(0)
            }
            Some(_) => Response::error(libc::EINVAL),
            None => Response::error(libc::EBADF),
        }
    }

    fn connect(&self, session: SessionId, addr: SocketAddrV4) -> Response {
        let mut state = self.state.lock();
        let (kind, local) = match state.sockets.get(&session) {
            Some(socket) => (socket.kind, socket.local),
            None => return Response::error(libc::EBADF),
        };
        let local = match local {
            Some(local) => local,
            None => state.ephemeral(),
        };

        if kind == Kind::Datagram {
            if let Some(socket) = state.sockets.get_mut(&session) {
                socket.local = Some(local);
                socket.peer = Some(addr);
            }
            return Response::int(0);
        }

        let listener = match state.find_bound(Kind::Stream, addr, true) {
            Some(listener) => listener,
            None => return Response::error(libc::ECONNREFUSED),
        };

        let accepted = state.next_session;
        state.next_session += 1;
        let server_side = SocketAddrV4::new(*addr.ip(), addr.port());
        let mut socket = VirtualSocket::new(Kind::Stream);
        socket.local = Some(server_side);
        socket.peer = Some(local);
        socket.peer_session = Some(session);
        state.sockets.insert(accepted, socket);

        if let Some(client) = state.sockets.get_mut(&session) {
            client.local = Some(local);
            client.peer = Some(server_side);
            client.peer_session = Some(accepted);
        }
        if let Some(listener) = state.sockets.get_mut(&listener) {
            listener.pending.push_back((accepted, local));
        }
        Response::int(0)
    }

    fn accept(&self, session: SessionId) -> Response {
        let mut state = self.state.lock();
        match state.sockets.get_mut(&session) {
            Some(socket) if socket.listening => match socket.pending.pop_front() {
                Some((accepted, peer)) => Response::accepted(peer, accepted),
                None => Response::error(libc::EAGAIN),
            },
            Some(_) => Response::error(libc::EINVAL),
            None => Response::error(libc::EBADF),
        }
    }

    fn send(&self, session: SessionId, _flags: i32, payload: Bytes) -> Response {
        let mut state = self.state.lock();
        let (kind, peer, peer_session, local) = match state.sockets.get(&session) {
            Some(s) => (s.kind, s.peer, s.peer_session, s.local),
            None => return Response::error(libc::EBADF),
        };

        match kind {
            Kind::Stream => {
                let peer = match peer_session.and_then(|p| state.sockets.get_mut(&p)) {
                    Some(peer) => peer,
                    None => return Response::error(libc::EPIPE),
                };
                peer.stream_inbox.extend(payload.iter().copied());
                Response::int(payload.len() as i64)
            }
            Kind::Datagram => {
                let (Some(dest), Some(source)) = (peer, local) else {
                    return Response::error(libc::EDESTADDRREQ);
                };
                if let Some(target) = state.find_bound(Kind::Datagram, dest, false) {
                    if let Some(target) = state.sockets.get_mut(&target) {
                        target.datagram_inbox.push_back((source, payload.to_vec()));
                    }
                }
                Response::int(payload.len() as i64)
            }
        }
    }

    fn sendto(&self, session: SessionId, _flags: i32, addr: SocketAddrV4, payload: Bytes) -> Response {
        let mut state = self.state.lock();
        let local = match state.sockets.get(&session) {
            Some(socket) if socket.kind == Kind::Datagram => socket.local,
            Some(_) => return Response::error(libc::EOPNOTSUPP),
            None => return Response::error(libc::EBADF),
        };
        let source = match local {
            Some(local) => local,
            None => {
                let local = state.ephemeral();
                if let Some(socket) = state.sockets.get_mut(&session) {
                    socket.local = Some(local);
                }
                local
            }
        };
        if let Some(target) = state.find_bound(Kind::Datagram, addr, false) {
            if let Some(target) = state.sockets.get_mut(&target) {
                target.datagram_inbox.push_back((source, payload.to_vec()));
            }
        }
        Response::int(payload.len() as i64)
    }

    fn recv(&self, session: SessionId, len: usize, _flags: i32) -> Response {
        let mut state = self.state.lock();
        let socket = match state.sockets.get_mut(&session) {
            Some(socket) => socket,
            None => return Response::error(libc::EBADF),
        };
        match socket.kind {
            Kind::Stream if socket.stream_inbox.is_empty() => Response::error(libc::EAGAIN),
            Kind::Stream => {
                let n = len.min(socket.stream_inbox.len());
                let data: Vec<u8> = socket.stream_inbox.drain(..n).collect();
                Response::data(data)
            }
            Kind::Datagram => match socket.datagram_inbox.pop_front() {
                Some((_, mut data)) => {
                    data.truncate(len);
                    Response::data(data)
                }
                None => Response::error(libc::EAGAIN),
            },
        }
    }

    fn recvfrom(&self, session: SessionId, len: usize, _flags: i32) -> Response {
        let mut state = self.state.lock();
        let socket = match state.sockets.get_mut(&session) {
            Some(socket) => socket,
            None => return Response::error(libc::EBADF),
        };
        match socket.kind {
            Kind::Datagram => match socket.datagram_inbox.pop_front() {
                Some((source, data)) => Response::datagram(source, &data[..data.len().min(len)]),
                None => Response::error(libc::EAGAIN),
            },
            Kind::Stream => {
                let (Some(peer), false) = (socket.peer, socket.stream_inbox.is_empty()) else {
                    return Response::error(libc::EAGAIN);
                };
                let n = len.min(socket.stream_inbox.len());
                let data: Vec<u8> = socket.stream_inbox.drain(..n).collect();
                Response::datagram(peer, &data)
            }
        }
    }

    fn close(&self, session: SessionId) -> Response {
        let mut state = self.state.lock();
        let socket = match state.sockets.remove(&session) {
            Some(socket) => socket,
            None => return Response::error(libc::EBADF),
        };
        if let Some(peer) = socket.peer_session.and_then(|p| state.sockets.get_mut(&p)) {
            peer.peer_session = None;
        }
        // Connections nobody accepted die with the listener.
        for (pending, _) in socket.pending {
            state.sockets.remove(&pending);
        }
        Response::int(0)
    }

    fn shutdown(&self, session: SessionId, _how: i32) -> Response {
        if self.state.lock().sockets.contains_key(&session) {
            Response::int(0)
        } else {
            Response::error(libc::EBADF)
        }
    }

    fn getsockopt(&self, session: SessionId, level: i32, option: i32) -> Response {
        match self.state.lock().sockets.get(&session) {
            Some(socket) => {
                let value = socket.options.get(&(level, option)).copied().unwrap_or(0);
                Response::int(i64::from(value))
            }
            None => Response::error(libc::EBADF),
        }
    }

    fn setsockopt(&self, session: SessionId, level: i32, option: i32, value: i32) -> Response {
        match self.state.lock().sockets.get_mut(&session) {
            Some(socket) => {
                socket.options.insert((level, option), value);
                Response::int(0)
            }
            None => Response::error(libc::EBADF),
        }
    }

    fn getpeername(&self, session: SessionId) -> Response {
        match self.state.lock().sockets.get(&session) {
            Some(socket) => match socket.peer {
                Some(peer) => Response::addr(peer),
                None => Response::error(libc::ENOTCONN),
            },
            None => Response::error(libc::EBADF),
        }
    }

    fn getsockname(&self, session: SessionId) -> Response {
        match self.state.lock().sockets.get(&session) {
            Some(socket) => Response::addr(
                socket
                    .local
                    .unwrap_or_else(|| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            ),
            None => Response::error(libc::EBADF),
        }
    }
}

/// Wraps a processor with a random delay before every call
pub struct Delayed<P> {
    inner: P,
    max_delay: Duration,
}

impl<P> Delayed<P> {
    pub fn new(inner: P, max_delay: Duration) -> Self {
        Self { inner, max_delay }
    }
}

impl<P: CallProcessor> CallProcessor for Delayed<P> {
    fn process(&self, request: Request) -> Response {
        let max = self.max_delay.as_micros() as u64;
        let delay = rand::thread_rng().gen_range(0..=max);
        std::thread::sleep(Duration::from_micros(delay));
        self.inner.process(request)
    }
}

/// A running mediator and an interposer pointed at it
pub struct Harness {
    pub listener: BackgroundListener,
    pub interposer: Interposer,
}

impl Harness {
    pub fn start(processor: Arc<dyn CallProcessor>) -> Self {
        let listener =
            BackgroundListener::spawn("127.0.0.1:0".parse().unwrap(), processor).unwrap();
        let port = match listener.local_addr() {
            SocketAddr::V4(addr) => addr.port(),
            other => panic!("unexpected listener address {}", other),
        };

        let mut config = InterposerConfig::default();
        config.mediator.port = port;
        config.mediator.roundtrip_timeout_ms = Some(10_000);
        let interposer = Interposer::new(&config, Arc::new(LibcSocketApi::linked())).unwrap();
        Self {
            listener,
            interposer,
        }
    }
}
