// src/interception/resolver.rs
//! Original-call resolver
//!
//! The interposer opens its own control channels with the same socket calls
//! it intercepts. Those channels must reach the genuine OS implementation, so
//! every native call goes through a [`NativeSocketApi`] handed to the
//! interposer at construction.
//!
//! Two symbol tables exist:
//!
//! - **Linked**: the libc symbols this binary was linked against. Correct for
//!   tests and for embedding the interposer in a normal program.
//! - **Next**: `dlsym(RTLD_NEXT, ..)`, resolved once per process. Required
//!   when this library is preloaded, because the linked names resolve back to
//!   our own exports.

use libc::{c_int, c_void, size_t, sockaddr, sockaddr_in, socklen_t, ssize_t};
use once_cell::sync::OnceCell;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::debug;

/// Genuine OS socket calls needed by the interposer itself
pub trait NativeSocketApi: Send + Sync {
    fn socket(&self, domain: c_int, socket_type: c_int, protocol: c_int) -> io::Result<RawFd>;

    fn connect(&self, fd: RawFd, addr: &SocketAddrV4) -> io::Result<()>;

    fn send(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize>;

    fn recv(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;

    fn close(&self, fd: RawFd) -> io::Result<()>;

    /// Bound both directions of blocking I/O on `fd`
    fn set_timeout(&self, fd: RawFd, timeout: Duration) -> io::Result<()>;
}

type SocketFn = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
type ConnectFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
type SendFn = unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t;
type RecvFn = unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t;
type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
type SetSockOptFn = unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int;

#[derive(Clone, Copy)]
struct SymbolTable {
    socket: SocketFn,
    connect: ConnectFn,
    send: SendFn,
    recv: RecvFn,
    close: CloseFn,
    setsockopt: SetSockOptFn,
}

static NEXT_SYMBOLS: OnceCell<SymbolTable> = OnceCell::new();

impl SymbolTable {
    fn linked() -> Self {
        Self {
            socket: libc::socket,
            connect: libc::connect,
            send: libc::send,
            recv: libc::recv,
            close: libc::close,
            setsockopt: libc::setsockopt,
        }
    }

    fn next() -> io::Result<Self> {
        NEXT_SYMBOLS
            .get_or_try_init(|| {
                // SAFETY: each name is NUL terminated and paired with the C
                // prototype of the libc function it names.
                let table = unsafe {
                    Self {
                        socket: lookup_next(b"socket\0")?,
                        connect: lookup_next(b"connect\0")?,
                        send: lookup_next(b"send\0")?,
                        recv: lookup_next(b"recv\0")?,
                        close: lookup_next(b"close\0")?,
                        setsockopt: lookup_next(b"setsockopt\0")?,
                    }
                };
                debug!("Resolved native socket symbols via RTLD_NEXT");
                Ok(table)
            })
            .copied()
    }
}

/// # Safety
///
/// `name` must be NUL terminated and `F` must be a function pointer type
/// matching the symbol's C prototype.
unsafe fn lookup_next<F: Copy>(name: &'static [u8]) -> io::Result<F> {
    debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<*mut c_void>());
    let symbol = libc::dlsym(libc::RTLD_NEXT, name.as_ptr().cast());
    if symbol.is_null() {
        let printable = String::from_utf8_lossy(&name[..name.len() - 1]).into_owned();
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no next definition of {}", printable),
        ));
    }
    Ok(mem::transmute_copy::<*mut c_void, F>(&symbol))
}

/// [`NativeSocketApi`] backed by a libc symbol table
#[derive(Clone, Copy)]
pub struct LibcSocketApi {
    symbols: SymbolTable,
}

impl LibcSocketApi {
    /// Call the libc symbols this binary links against
    pub fn linked() -> Self {
        Self {
            symbols: SymbolTable::linked(),
        }
    }

    /// Call the next definitions after this library in lookup order
    pub fn next_symbols() -> io::Result<Self> {
        Ok(Self {
            symbols: SymbolTable::next()?,
        })
    }
}

fn check(ret: c_int) -> io::Result<c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn check_len(ret: ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

impl NativeSocketApi for LibcSocketApi {
    fn socket(&self, domain: c_int, socket_type: c_int, protocol: c_int) -> io::Result<RawFd> {
        check(unsafe { (self.symbols.socket)(domain, socket_type, protocol) })
    }

    fn connect(&self, fd: RawFd, addr: &SocketAddrV4) -> io::Result<()> {
        let raw = to_sockaddr_in(addr);
        check(unsafe {
            (self.symbols.connect)(
                fd,
                (&raw as *const sockaddr_in).cast(),
                mem::size_of::<sockaddr_in>() as socklen_t,
            )
        })?;
        Ok(())
    }

    fn send(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        check_len(unsafe {
            (self.symbols.send)(fd, buf.as_ptr().cast(), buf.len(), send_flags())
        })
    }

    fn recv(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        check_len(unsafe { (self.symbols.recv)(fd, buf.as_mut_ptr().cast(), buf.len(), 0) })
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        check(unsafe { (self.symbols.close)(fd) })?;
        Ok(())
    }

    fn set_timeout(&self, fd: RawFd, timeout: Duration) -> io::Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        for option in [libc::SO_RCVTIMEO, libc::SO_SNDTIMEO] {
            check(unsafe {
                (self.symbols.setsockopt)(
                    fd,
                    libc::SOL_SOCKET,
                    option,
                    (&tv as *const libc::timeval).cast(),
                    mem::size_of::<libc::timeval>() as socklen_t,
                )
            })?;
        }
        Ok(())
    }
}

// A vanished mediator must surface as EPIPE, not kill the host process.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn send_flags() -> c_int {
    libc::MSG_NOSIGNAL
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn send_flags() -> c_int {
    0
}

/// Native IPv4 socket address
pub fn to_sockaddr_in(addr: &SocketAddrV4) -> sockaddr_in {
    // SAFETY: sockaddr_in is plain old data; all-zero is a valid value.
    let mut raw: sockaddr_in = unsafe { mem::zeroed() };
    raw.sin_family = libc::AF_INET as libc::sa_family_t;
    raw.sin_port = addr.port().to_be();
    raw.sin_addr = libc::in_addr {
        s_addr: u32::from(*addr.ip()).to_be(),
    };
    raw
}

/// Convert a native IPv4 socket address
pub fn from_sockaddr_in(raw: &sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr)),
        u16::from_be(raw.sin_port),
    )
}
