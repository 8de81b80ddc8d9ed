// src/interception/channel.rs
//! Control channels to the mediator
//!
//! Each local socket handle owns one stream connection to the mediator. A
//! roundtrip writes one whole request frame and reads one whole response
//! frame; the caller holds the channel exclusively for that time, so frames
//! from concurrent calls never interleave on a stream.

use crate::interception::resolver::NativeSocketApi;
use crate::protocol::{Call, RequestFrame, ResponseFrame, RESPONSE_FRAME_LEN};
use crate::utils::errors::{InterposeError, Result};
use bytes::BytesMut;
use std::io;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Metric: completed roundtrips, labelled by call
pub const ROUNDTRIPS_TOTAL: &str = "netinterpose_roundtrips_total";

/// Metric: roundtrips that broke their channel
pub const TRANSPORT_FAILURES_TOTAL: &str = "netinterpose_transport_failures_total";

/// Metric: control channels opened
pub const CHANNELS_OPENED_TOTAL: &str = "netinterpose_channels_opened_total";

/// Metric: roundtrip latency in seconds
pub const ROUNDTRIP_SECONDS: &str = "netinterpose_roundtrip_seconds";

/// One stream connection to the mediator
pub struct ControlChannel {
    fd: RawFd,
    native: Arc<dyn NativeSocketApi>,
    broken: bool,
    released: bool,
}

impl ControlChannel {
    fn new(fd: RawFd, native: Arc<dyn NativeSocketApi>) -> Self {
        Self {
            fd,
            native,
            broken: false,
            released: false,
        }
    }

    /// Descriptor of the connection; doubles as the local socket handle
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Whether an earlier roundtrip failed part way
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Write one request and block for its response
    pub fn roundtrip(&mut self, request: &RequestFrame) -> Result<ResponseFrame> {
        if self.released {
            return Err(InterposeError::TransportError(format!(
                "channel {} already released",
                self.fd
            )));
        }
        if self.broken {
            // The stream may hold half a frame; nothing after it can be trusted.
            return Err(InterposeError::TransportError(format!(
                "channel {} is broken",
                self.fd
            )));
        }

        let result = self
            .write_frame(request.as_bytes())
            .and_then(|_| self.read_frame());
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    fn write_frame(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.native.send(self.fd, buf) {
                Ok(0) => return Err(self.closed("write")),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.failed("write", e)),
            }
        }
        Ok(())
    }

    fn read_frame(&mut self) -> Result<ResponseFrame> {
        let mut buf = BytesMut::zeroed(RESPONSE_FRAME_LEN);
        let mut filled = 0;
        while filled < RESPONSE_FRAME_LEN {
            match self.native.recv(self.fd, &mut buf[filled..]) {
                Ok(0) => return Err(self.closed("read")),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.failed("read", e)),
            }
        }
        ResponseFrame::from_bytes(buf.freeze())
    }

    fn closed(&self, op: &str) -> InterposeError {
        InterposeError::TransportError(format!(
            "mediator closed channel {} during {}",
            self.fd, op
        ))
    }

    fn failed(&self, op: &str, e: io::Error) -> InterposeError {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                InterposeError::TransportError(format!(
                    "channel {} timed out during {}",
                    self.fd, op
                ))
            }
            _ => InterposeError::TransportError(format!(
                "channel {} {} failed: {}",
                self.fd, op, e
            )),
        }
    }

    /// Close the connection; later roundtrips fail
    pub fn release(&mut self) -> io::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.native.close(self.fd)
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to close channel {}: {}", self.fd, e);
        }
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("fd", &self.fd)
            .field("broken", &self.broken)
            .field("released", &self.released)
            .finish()
    }
}

/// Opens control channels and runs roundtrips over them
pub struct ChannelManager {
    endpoint: SocketAddrV4,
    timeout: Option<Duration>,
    native: Arc<dyn NativeSocketApi>,
}

impl ChannelManager {
    pub fn new(
        endpoint: SocketAddrV4,
        timeout: Option<Duration>,
        native: Arc<dyn NativeSocketApi>,
    ) -> Self {
        Self {
            endpoint,
            timeout,
            native,
        }
    }

    pub fn endpoint(&self) -> SocketAddrV4 {
        self.endpoint
    }

    /// Connect a fresh channel to the mediator
    pub fn open(&self) -> Result<ControlChannel> {
        let fd = self
            .native
            .socket(libc::AF_INET, libc::SOCK_STREAM, 0)
            .map_err(|e| InterposeError::ChannelOpen(format!("socket: {}", e)))?;

        // From here on, dropping the channel closes the descriptor.
        let channel = ControlChannel::new(fd, self.native.clone());

        if let Some(timeout) = self.timeout {
            self.native
                .set_timeout(fd, timeout)
                .map_err(|e| InterposeError::ChannelOpen(format!("set timeout: {}", e)))?;
        }

        loop {
            match self.native.connect(fd, &self.endpoint) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(InterposeError::ChannelOpen(format!(
                        "connect {}: {}",
                        self.endpoint, e
                    )))
                }
            }
        }

        metrics::counter!(CHANNELS_OPENED_TOTAL).increment(1);
        debug!("Opened channel {} to mediator {}", fd, self.endpoint);
        Ok(channel)
    }

    /// One request/response exchange, with metrics
    pub fn roundtrip(
        &self,
        channel: &mut ControlChannel,
        request: &RequestFrame,
    ) -> Result<ResponseFrame> {
        let call = request
            .call_name()
            .ok()
            .and_then(Call::from_name)
            .map(|call| call.name())
            .unwrap_or("unknown");

        let started = Instant::now();
        match channel.roundtrip(request) {
            Ok(response) => {
                metrics::counter!(ROUNDTRIPS_TOTAL, "call" => call).increment(1);
                metrics::histogram!(ROUNDTRIP_SECONDS, "call" => call)
                    .record(started.elapsed().as_secs_f64());
                debug!(
                    "{} on channel {} -> status {}",
                    call,
                    channel.fd(),
                    response.status()
                );
                Ok(response)
            }
            Err(e) => {
                metrics::counter!(TRANSPORT_FAILURES_TOTAL, "call" => call).increment(1);
                warn!("{} on channel {} failed: {}", call, channel.fd(), e);
                Err(e)
            }
        }
    }
}
