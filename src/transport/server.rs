//! Reference newline-JSON backend.
//!
//! [`EchoServer`] answers every request line with a reply carrying the same
//! id, the value prefixed with [`REPLY_PREFIX`], and the current time in
//! nanoseconds. It is used by the test suite and the demos.
//!
//! # Session Flow
//!
//! 1. `EchoServer::bind` binds a listener (port 0 picks a free port)
//! 2. An accept loop spawns one task per client connection
//! 3. Each task replies to request lines until the client hangs up,
//!    sends a line that is not a request, or the server shuts down

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::{Reply, Request};

// ============================================================================
// Constants
// ============================================================================

/// Prefix the server puts in front of every echoed value.
pub const REPLY_PREFIX: &str = "server: hello, ";

// ============================================================================
// EchoServer
// ============================================================================

/// A bound, running echo backend.
///
/// Dropping the server stops accepting and ends every live session.
///
/// # Example
///
/// ```ignore
/// use std::net::{IpAddr, Ipv4Addr};
/// use linepool::transport::EchoServer;
///
/// let server = EchoServer::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await?;
/// let options = linepool::PoolOptions::new(server.address());
/// ```
pub struct EchoServer {
    /// Local address the listener is bound to.
    local_addr: SocketAddr,
    /// Stops the accept loop and all sessions.
    shutdown: CancellationToken,
    /// Number of client connections accepted so far.
    accepted: Arc<AtomicUsize>,
}

impl EchoServer {
    /// Binds the server and starts accepting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if binding fails.
    pub async fn bind(ip: IpAddr, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(ip, port)).await?;
        let local_addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let accepted = Arc::new(AtomicUsize::new(0));

        tokio::spawn(Self::accept_loop(
            listener,
            shutdown.clone(),
            Arc::clone(&accepted),
        ));

        info!(%local_addr, "Echo server listening");

        Ok(Self {
            local_addr,
            shutdown,
            accepted,
        })
    }

    /// Returns the local socket address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the address as `host:port`, suitable for
    /// [`PoolOptions::new`](crate::PoolOptions::new).
    #[inline]
    #[must_use]
    pub fn address(&self) -> String {
        self.local_addr.to_string()
    }

    /// Returns how many client connections have been accepted.
    #[inline]
    #[must_use]
    pub fn accepted_count(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Stops accepting and closes every live session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn accept_loop(
        listener: TcpListener,
        shutdown: CancellationToken,
        accepted: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,

                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        accepted.fetch_add(1, Ordering::SeqCst);
                        debug!(%peer, "Client connected");
                        tokio::spawn(Self::serve(stream, peer, shutdown.child_token()));
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }

        debug!("Echo server stopped accepting");
    }

    async fn serve(stream: TcpStream, peer: SocketAddr, shutdown: CancellationToken) {
        let (read_half, write_half) = stream.into_split();
        let mut lines = FramedRead::new(read_half, LinesCodec::new());
        let mut sink = FramedWrite::new(write_half, LinesCodec::new());

        loop {
            let line = tokio::select! {
                () = shutdown.cancelled() => break,
                line = lines.next() => line,
            };

            let line = match line {
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    warn!(%peer, error = %e, "Read from client failed");
                    break;
                }
                None => break,
            };

            let request: Request = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(e) => {
                    warn!(%peer, error = %e, "Undecodable request, dropping client");
                    break;
                }
            };

            let reply = Reply::now(request.id, format!("{REPLY_PREFIX}{}", request.value));
            let frame = match serde_json::to_string(&reply) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(%peer, error = %e, "Failed to encode reply");
                    break;
                }
            };

            if let Err(e) = sink.send(frame).await {
                warn!(%peer, error = %e, "Write to client failed");
                break;
            }
        }

        debug!(%peer, "Client session ended");
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// Tests
// ============================================================================
