// src/interception/preload.rs
//! C ABI exports for `LD_PRELOAD`
//!
//! Built only with the `preload` feature. Each export converts its C
//! arguments, calls the process-wide [`Interposer`] and reports failures the
//! native way: `-1` plus `errno`.
//!
//! The interposer is created on the first intercepted call. Its native calls
//! come from `RTLD_NEXT`, never from the names exported here.
//!
//! Limitation: plain `read`/`write` on an intercepted handle are not
//! exported and reach the control channel directly.

use crate::interception::interposer::Interposer;
use crate::interception::resolver::{
    from_sockaddr_in, to_sockaddr_in, LibcSocketApi, NativeSocketApi,
};
use crate::observability::init_tracing;
use crate::utils::config::InterposerConfig;
use crate::utils::errors::{InterposeError, Result};
use libc::{c_int, c_void, size_t, sockaddr, sockaddr_in, socklen_t, ssize_t};
use once_cell::sync::OnceCell;
use std::fmt::Display;
use std::mem;
use std::net::SocketAddrV4;
use std::ptr;
use std::sync::Arc;
use tracing::{debug, error, warn};

static INTERPOSER: OnceCell<Interposer> = OnceCell::new();

fn fatal(what: &str, err: impl Display) -> ! {
    error!("{}: {}", what, err);
    eprintln!("netinterpose: {}: {}", what, err);
    std::process::exit(1)
}

fn interposer() -> &'static Interposer {
    INTERPOSER.get_or_init(|| {
        let (config, load_error) = match InterposerConfig::load() {
            Ok(config) => (config, None),
            Err(e) => (InterposerConfig::default(), Some(e)),
        };
        if let Err(e) = init_tracing(&config.logging) {
            eprintln!("netinterpose: {}", e);
        }
        if let Some(e) = load_error {
            warn!("Ignoring configuration, using defaults: {}", e);
        }

        let native = match LibcSocketApi::next_symbols() {
            Ok(native) => native,
            Err(e) => fatal("cannot resolve native socket calls", e),
        };
        match Interposer::new(&config, Arc::new(native)) {
            Ok(interposer) => interposer,
            Err(e) => fatal("cannot start interposer", e),
        }
    })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut c_int {
    libc::__errno_location()
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut c_int {
    libc::__error()
}

fn set_errno(code: c_int) {
    // SAFETY: errno is thread local and always addressable.
    unsafe { *errno_location() = code }
}

/// Report `err` natively; losing the mediator while creating a session ends
/// the process.
fn fail<T>(call: &str, err: InterposeError, sentinel: T) -> T {
    if matches!(err, InterposeError::ChannelOpen(_)) {
        fatal(&format!("{}: mediator unreachable", call), err);
    }
    debug!("{} failed: {} ({})", call, err, err.errno_desc());
    set_errno(err.errno());
    sentinel
}

fn status(call: &str, result: Result<()>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(e) => fail(call, e, -1),
    }
}

fn length(call: &str, result: Result<usize>) -> ssize_t {
    match result {
        Ok(n) => n as ssize_t,
        Err(e) => fail(call, e, -1),
    }
}

/// # Safety
///
/// `addr` must be null or point to `len` readable bytes.
unsafe fn read_sockaddr(addr: *const sockaddr, len: socklen_t) -> Result<SocketAddrV4> {
    if addr.is_null() {
        return Err(InterposeError::InvalidArgument("null address".to_string()));
    }
    if (*addr).sa_family as c_int != libc::AF_INET {
        return Err(InterposeError::Unsupported(format!(
            "address family {}",
            (*addr).sa_family
        )));
    }
    if (len as usize) < mem::size_of::<sockaddr_in>() {
        return Err(InterposeError::InvalidArgument(format!(
            "address length {}",
            len
        )));
    }
    let raw = ptr::read_unaligned(addr.cast::<sockaddr_in>());
    Ok(from_sockaddr_in(&raw))
}

/// Copy an address out the way the kernel does: truncate to the caller's
/// buffer and report the full length.
///
/// # Safety
///
/// When non-null, `len` must be readable and writable and `out` must have
/// `*len` writable bytes.
unsafe fn write_sockaddr(addr: SocketAddrV4, out: *mut sockaddr, len: *mut socklen_t) {
    if out.is_null() || len.is_null() {
        return;
    }
    let raw = to_sockaddr_in(&addr);
    let full = mem::size_of::<sockaddr_in>();
    let n = (*len as usize).min(full);
    ptr::copy_nonoverlapping((&raw as *const sockaddr_in).cast::<u8>(), out.cast::<u8>(), n);
    *len = full as socklen_t;
}

unsafe fn slice<'a>(buf: *const c_void, len: size_t) -> &'a [u8] {
    if buf.is_null() || len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(buf.cast::<u8>(), len)
    }
}

unsafe fn slice_mut<'a>(buf: *mut c_void, len: size_t) -> &'a mut [u8] {
    if buf.is_null() || len == 0 {
        &mut []
    } else {
        std::slice::from_raw_parts_mut(buf.cast::<u8>(), len)
    }
}

#[no_mangle]
pub extern "C" fn socket(domain: c_int, socket_type: c_int, protocol: c_int) -> c_int {
    match interposer().socket(domain, socket_type, protocol) {
        Ok(handle) => handle,
        Err(e) => fail("socket", e, -1),
    }
}

#[no_mangle]
pub unsafe extern "C" fn bind(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    let result = read_sockaddr(addr, len).and_then(|addr| interposer().bind(fd, addr));
    status("bind", result)
}

#[no_mangle]
pub extern "C" fn listen(fd: c_int, backlog: c_int) -> c_int {
    status("listen", interposer().listen(fd, backlog))
}

#[no_mangle]
pub unsafe extern "C" fn accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    match interposer().accept(fd) {
        Ok((handle, peer)) => {
            write_sockaddr(peer, addr, len);
            handle
        }
        Err(e) => fail("accept", e, -1),
    }
}

#[no_mangle]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    let result = read_sockaddr(addr, len).and_then(|addr| interposer().connect(fd, addr));
    status("connect", result)
}

#[no_mangle]
pub unsafe extern "C" fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    length("send", interposer().send(fd, slice(buf, len), flags))
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    addr: *const sockaddr,
    addr_len: socklen_t,
) -> ssize_t {
    let data = slice(buf, len);
    let result = if addr.is_null() {
        // sendto without a destination is send on a connected socket
        interposer().send(fd, data, flags)
    } else {
        read_sockaddr(addr, addr_len).and_then(|addr| interposer().send_to(fd, data, flags, addr))
    };
    length("sendto", result)
}

#[no_mangle]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    length("recv", interposer().recv(fd, slice_mut(buf, len), flags))
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    addr: *mut sockaddr,
    addr_len: *mut socklen_t,
) -> ssize_t {
    match interposer().recv_from(fd, slice_mut(buf, len), flags) {
        Ok((n, source)) => {
            write_sockaddr(source, addr, addr_len);
            n as ssize_t
        }
        Err(e) => fail("recvfrom", e, -1),
    }
}

#[no_mangle]
pub extern "C" fn close(fd: c_int) -> c_int {
    // Before the first socket call there are no sessions to look up.
    let result = match INTERPOSER.get() {
        Some(interposer) => interposer.close(fd),
        None => match LibcSocketApi::next_symbols() {
            Ok(native) => native.close(fd).map_err(|e| {
                if e.raw_os_error() == Some(libc::EBADF) {
                    InterposeError::UnknownHandle(fd)
                } else {
                    InterposeError::Native(e)
                }
            }),
            Err(e) => fatal("cannot resolve native close", e),
        },
    };
    status("close", result)
}

#[no_mangle]
pub extern "C" fn shutdown(fd: c_int, how: c_int) -> c_int {
    status("shutdown", interposer().shutdown(fd, how))
}

#[no_mangle]
pub unsafe extern "C" fn getsockopt(
    fd: c_int,
    level: c_int,
    option: c_int,
    value: *mut c_void,
    len: *mut socklen_t,
) -> c_int {
    if value.is_null() || len.is_null() || (*len as usize) < mem::size_of::<c_int>() {
        set_errno(libc::EINVAL);
        return -1;
    }
    match interposer().getsockopt(fd, level, option) {
        Ok(v) => {
            ptr::write_unaligned(value.cast::<c_int>(), v);
            *len = mem::size_of::<c_int>() as socklen_t;
            0
        }
        Err(e) => fail("getsockopt", e, -1),
    }
}

#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    fd: c_int,
    level: c_int,
    option: c_int,
    value: *const c_void,
    len: socklen_t,
) -> c_int {
    if value.is_null() || (len as usize) < mem::size_of::<c_int>() {
        set_errno(libc::EINVAL);
        return -1;
    }
    let v = ptr::read_unaligned(value.cast::<c_int>());
    status("setsockopt", interposer().setsockopt(fd, level, option, v))
}

#[no_mangle]
pub unsafe extern "C" fn getpeername(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    match interposer().peer_addr(fd) {
        Ok(peer) => {
            write_sockaddr(peer, addr, len);
            0
        }
        Err(e) => fail("getpeername", e, -1),
    }
}

#[no_mangle]
pub unsafe extern "C" fn getsockname(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    match interposer().local_addr(fd) {
        Ok(local) => {
            write_sockaddr(local, addr, len);
            0
        }
        Err(e) => fail("getsockname", e, -1),
    }
}
