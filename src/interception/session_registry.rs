// src/interception/session_registry.rs
//! Session registry mapping local socket handles to mediator sessions
//!
//! Every intercepted socket is a [`Session`]: the handle returned to the
//! application, the mediator's session id, and the control channel both are
//! reached through. Lookups are concurrent; each session serializes its own
//! calls behind a mutex held for the whole roundtrip.

use crate::interception::channel::ControlChannel;
use crate::protocol::{Call, SessionId};
use crate::utils::errors::{InterposeError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Handle the application sees; the fd of the session's control channel
pub type LocalHandle = RawFd;

/// Lifecycle of an intercepted socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Created,
    Bound,
    Listening,
    Connected,
    Closed,
}

impl SocketState {
    pub fn name(&self) -> &'static str {
        match self {
            SocketState::Created => "created",
            SocketState::Bound => "bound",
            SocketState::Listening => "listening",
            SocketState::Connected => "connected",
            SocketState::Closed => "closed",
        }
    }

    /// Reject calls the socket cannot make in this state
    pub fn check(&self, call: Call, handle: LocalHandle) -> Result<()> {
        use SocketState::*;

        let errno = match (call, self) {
            (_, Closed) => return Err(InterposeError::UnknownHandle(handle)),
            (Call::Socket, _) => libc::EINVAL,
            (Call::Bind, Created) => return Ok(()),
            (Call::Bind, _) => libc::EINVAL,
            (Call::Listen, Bound) => return Ok(()),
            (Call::Listen, _) => libc::EINVAL,
            (Call::Accept, Listening) => return Ok(()),
            (Call::Accept, _) => libc::EINVAL,
            (Call::Connect, Created | Bound) => return Ok(()),
            (Call::Connect, Connected) => libc::EISCONN,
            (Call::Connect, _) => libc::EINVAL,
            (Call::Send | Call::Recv | Call::GetPeerName, Connected) => return Ok(()),
            (Call::Send | Call::Recv | Call::GetPeerName, _) => libc::ENOTCONN,
            (Call::SendTo, Created | Bound | Connected) => return Ok(()),
            (Call::SendTo, _) => libc::ENOTCONN,
            (Call::RecvFrom, Bound | Connected) => return Ok(()),
            (Call::RecvFrom, _) => libc::ENOTCONN,
            (
                Call::Close
                | Call::Shutdown
                | Call::GetSockOpt
                | Call::SetSockOpt
                | Call::GetSockName,
                _,
            ) => return Ok(()),
        };

        Err(InterposeError::InvalidState {
            call: call.name(),
            state: self.name(),
            errno,
        })
    }

    /// State after `call` succeeded
    pub fn after(&self, call: Call) -> SocketState {
        match call {
            Call::Bind => SocketState::Bound,
            Call::Listen => SocketState::Listening,
            Call::Connect => SocketState::Connected,
            Call::Close => SocketState::Closed,
            // sendto on a fresh socket binds it implicitly
            Call::SendTo if *self == SocketState::Created => SocketState::Bound,
            _ => *self,
        }
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Mutable part of a session, guarded by the session mutex
#[derive(Debug)]
pub struct SessionInner {
    pub channel: ControlChannel,
    pub state: SocketState,
}

/// One intercepted socket
#[derive(Debug)]
pub struct Session {
    local: LocalHandle,
    remote: SessionId,
    inner: Mutex<SessionInner>,
}

impl Session {
    /// The local handle is taken from the channel descriptor
    pub fn new(remote: SessionId, channel: ControlChannel, state: SocketState) -> Self {
        Self {
            local: channel.fd(),
            remote,
            inner: Mutex::new(SessionInner { channel, state }),
        }
    }

    pub fn local(&self) -> LocalHandle {
        self.local
    }

    pub fn remote(&self) -> SessionId {
        self.remote
    }

    /// Exclusive access for one call
    pub fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock()
    }

    pub fn state(&self) -> SocketState {
        self.inner.lock().state
    }
}

/// A reserved place in the registry
///
/// Reserving before a channel is opened keeps the live session count within
/// bound without ever opening a channel that cannot be registered. Dropping
/// an unused slot gives it back.
pub struct SessionSlot<'a> {
    registry: &'a SessionRegistry,
    committed: bool,
}

impl Drop for SessionSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Concurrent map from local handle to session
pub struct SessionRegistry {
    entries: DashMap<LocalHandle, Arc<Session>>,
    live: AtomicUsize,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            entries: DashMap::new(),
            live: AtomicUsize::new(0),
            max_sessions,
        }
    }

    /// Claim room for one more session
    pub fn reserve(&self) -> Result<SessionSlot<'_>> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.max_sessions).then_some(live + 1)
            })
            .map_err(InterposeError::SessionLimit)?;
        Ok(SessionSlot {
            registry: self,
            committed: false,
        })
    }

    /// Insert a session under its local handle; never overwrites
    pub fn register(&self, mut slot: SessionSlot<'_>, session: Session) -> Result<Arc<Session>> {
        let local = session.local();
        match self.entries.entry(local) {
            Entry::Occupied(_) => {
                error!(
                    "Handle {} already registered, refusing session {}",
                    local,
                    session.remote()
                );
                Err(InterposeError::DuplicateHandle(local))
            }
            Entry::Vacant(vacant) => {
                let session = Arc::new(session);
                vacant.insert(session.clone());
                slot.committed = true;
                debug!("Registered handle {} -> session {}", local, session.remote());
                Ok(session)
            }
        }
    }

    pub fn lookup(&self, local: LocalHandle) -> Result<Arc<Session>> {
        self.entries
            .get(&local)
            .map(|entry| entry.value().clone())
            .ok_or(InterposeError::UnknownHandle(local))
    }

    pub fn remove(&self, local: LocalHandle) -> Result<Arc<Session>> {
        let (_, session) = self
            .entries
            .remove(&local)
            .ok_or(InterposeError::UnknownHandle(local))?;
        self.live.fetch_sub(1, Ordering::AcqRel);
        debug!("Removed handle {} (session {})", local, session.remote());
        Ok(session)
    }

    pub fn contains(&self, local: LocalHandle) -> bool {
        self.entries.contains_key(&local)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn handles(&self) -> Vec<LocalHandle> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }
}
