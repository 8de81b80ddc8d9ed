// src/listener/server.rs
//! Mediator-side channel listener
//!
//! Accepts control channels and serves each one in its own task: read a
//! request frame, run it through the [`CallProcessor`] on the blocking pool,
//! write the response frame. Requests on one channel are answered strictly
//! in order.

use crate::listener::codec::MediatorCodec;
use crate::listener::processor::CallProcessor;
use crate::protocol::{Request, Response};
use crate::utils::errors::{InterposeError, Result};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Metric: channels accepted by the listener
pub const CHANNELS_ACCEPTED_TOTAL: &str = "netinterpose_listener_channels_total";

/// Metric: requests that failed to decode
pub const MALFORMED_REQUESTS_TOTAL: &str = "netinterpose_listener_malformed_total";

/// Accepts interposer channels and answers their calls
pub struct MediatorListener {
    listener: TcpListener,
    processor: Arc<dyn CallProcessor>,
    shutdown: CancellationToken,
    next_channel: AtomicU64,
}

impl MediatorListener {
    pub async fn bind(addr: SocketAddr, processor: Arc<dyn CallProcessor>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Mediator listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            processor,
            shutdown: CancellationToken::new(),
            next_channel: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Cancelling this token stops the accept loop and every channel task
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until the shutdown token is cancelled
    pub async fn serve(self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Mediator listener shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    let channel = self.next_channel.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Channel {} from {}: cannot disable Nagle: {}", channel, peer, e);
                    }
                    metrics::counter!(CHANNELS_ACCEPTED_TOTAL).increment(1);
                    debug!("Channel {} opened from {}", channel, peer);

                    tokio::spawn(serve_channel(
                        channel,
                        stream,
                        self.processor.clone(),
                        self.shutdown.child_token(),
                    ));
                }
            }
        }
    }
}

async fn serve_channel(
    channel: u64,
    stream: TcpStream,
    processor: Arc<dyn CallProcessor>,
    shutdown: CancellationToken,
) {
    let mut framed = Framed::new(stream, MediatorCodec::new());

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = framed.next() => match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!("Channel {} read failed: {}", channel, e);
                    break;
                }
                None => break,
            },
        };

        let response = match Request::decode(&frame) {
            Ok(request) => {
                let call = request.call();
                match request.session() {
                    Some(session) => trace!("Channel {}: {} on session {}", channel, call, session),
                    None => trace!("Channel {}: {}", channel, call),
                }
                let processor = processor.clone();
                match tokio::task::spawn_blocking(move || processor.process(request)).await {
                    Ok(response) => response,
                    Err(e) => {
                        error!("Channel {} handler for {} failed: {}", channel, call, e);
                        Response::error(libc::EIO)
                    }
                }
            }
            Err(e) => {
                metrics::counter!(MALFORMED_REQUESTS_TOTAL).increment(1);
                warn!("Channel {} sent a malformed request: {}", channel, e);
                Response::error(libc::EPROTO)
            }
        };

        if let Err(e) = framed.send(response.encode()).await {
            warn!("Channel {} write failed: {}", channel, e);
            break;
        }
    }

    debug!("Channel {} closed", channel);
}

/// A [`MediatorListener`] running on its own thread and runtime
///
/// For synchronous callers. Dropping it stops the listener and waits for the
/// thread to finish.
pub struct BackgroundListener {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl BackgroundListener {
    pub fn spawn(addr: SocketAddr, processor: Arc<dyn CallProcessor>) -> Result<Self> {
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name("mediator-listener".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(InterposeError::from(e)));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let listener = match MediatorListener::bind(addr, processor).await {
                        Ok(listener) => listener,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let ready = listener
                        .local_addr()
                        .map(|local| (local, listener.shutdown_token()));
                    if ready_tx.send(ready).is_err() {
                        return;
                    }
                    if let Err(e) = listener.serve().await {
                        error!("Mediator listener failed: {}", e);
                    }
                });
                runtime.shutdown_timeout(Duration::from_secs(1));
            })?;

        let (local_addr, shutdown) = ready_rx.blocking_recv().map_err(|_| {
            InterposeError::TransportError("listener thread exited during startup".to_string())
        })??;

        Ok(Self {
            local_addr,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop serving and close every channel
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Mediator listener thread panicked");
            }
        }
    }
}

impl Drop for BackgroundListener {
    fn drop(&mut self) {
        self.stop();
    }
}
