//! Multiplexed TCP connection.
//!
//! This module turns one ordered byte stream into many independently awaited
//! replies. Requests carry a correlation id; the backend echoes it and may
//! answer in any order.
//!
//! # Read Loop
//!
//! Each connection spawns one tokio task that:
//!
//! - Reads newline-delimited reply frames
//! - Routes each reply to the pending slot registered under its id
//! - Skips frames that do not decode as a reply
//! - Records the terminal error and closes the connection on EOF or read failure
//! - Exits as soon as the connection's shutdown token fires

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::options::PoolOptions;
use crate::protocol::{Reply, Request};

use super::reply::ReplyHandle;
use super::socket;

// ============================================================================
// Types
// ============================================================================

/// Map of correlation ids to reply slots.
type PendingMap = FxHashMap<String, oneshot::Sender<String>>;

/// Framed write half of the socket.
type LineWriter = FramedWrite<OwnedWriteHalf, LinesCodec>;

/// Framed read half of the socket.
type LineReader = FramedRead<OwnedReadHalf, LinesCodec>;

/// Source of process-unique connection ids.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Shared
// ============================================================================

/// State shared between a [`Connection`] and its read loop.
pub(crate) struct Shared {
    id: u64,
    address: String,
    pending: Mutex<PendingMap>,
    /// `None` once the connection is closed.
    writer: AsyncMutex<Option<LineWriter>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    last_error: OnceLock<Error>,
}

impl Shared {
    /// Removes a slot whose caller stopped waiting.
    pub(crate) fn abandon(&self, id: &str) {
        if self.pending.lock().remove(id).is_some() {
            trace!(conn = self.id, id, "Abandoned pending reply");
        }
    }

    /// Closed explicitly, by the read loop, or broken by an interrupted write.
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.shutdown.is_cancelled()
    }

    /// Writes one frame, giving up if the connection shuts down mid-write.
    ///
    /// If the caller drops this future before the write finishes, part of
    /// the frame may already sit in the write buffer and the stream can no
    /// longer be framed, so the connection is shut down.
    async fn write_frame(&self, frame: String) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::ConnectionClosed)?;

        let in_flight = InFlightWrite { shared: self };
        let result = tokio::select! {
            result = writer.send(frame) => result.map_err(Error::from),
            () = self.shutdown.cancelled() => Err(Error::ConnectionClosed),
        };
        in_flight.finish();
        result
    }

    /// Routes one reply frame to its waiter.
    fn dispatch(&self, frame: &str) {
        if frame.trim().is_empty() {
            return;
        }

        let reply = match Reply::from_frame(frame) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(conn = self.id, error = %e, "Skipping malformed reply frame");
                return;
            }
        };

        let slot = self.pending.lock().remove(&reply.id);
        match slot {
            Some(tx) => {
                if tx.send(reply.render()).is_err() {
                    trace!(conn = self.id, id = %reply.id, "Reply waiter already gone");
                }
            }
            None => {
                debug!(conn = self.id, id = %reply.id, "Reply for unknown request, discarded");
            }
        }
    }

    /// Records the terminal error and tears the connection down.
    async fn fail(&self, error: Error) {
        debug!(conn = self.id, error = %error, "Read loop stopped");
        let _ = self.last_error.set(error);
        if let Err(e) = self.close().await {
            trace!(conn = self.id, error = %e, "Close after read failure");
        }
    }

    /// Closes the transport and every pending slot. Runs once.
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown.cancel();

        // Unsent bytes are discarded; a peer that stopped reading must not
        // hold the close up.
        let writer = self.writer.lock().await.take();
        let result = match writer {
            Some(writer) => {
                let mut half = writer.into_inner();
                half.shutdown().await.map_err(Error::from)
            }
            None => Ok(()),
        };

        let pending: Vec<_> = self.pending.lock().drain().collect();
        let count = pending.len();
        // Dropping the senders resolves each handle with no value.
        drop(pending);

        debug!(conn = self.id, address = %self.address, pending = count, "Connection closed");
        result
    }
}

/// Write that has started but not yet completed.
///
/// Dropped without [`finish`](Self::finish) only when the caller abandons
/// `send` mid-write.
struct InFlightWrite<'a> {
    shared: &'a Shared,
}

impl InFlightWrite<'_> {
    fn finish(self) {
        std::mem::forget(self);
    }
}

impl Drop for InFlightWrite<'_> {
    fn drop(&mut self) {
        warn!(conn = self.shared.id, "Request write interrupted, shutting connection down");
        self.shared.shutdown.cancel();
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One persistent TCP connection to the backend.
///
/// Many requests can be in flight at once; replies are matched to their
/// waiters by id regardless of arrival order. Writes go through an async
/// mutex, so concurrent [`send`](Self::send) calls never interleave frames.
///
/// Dropping a connection without calling [`close`](Self::close) still stops
/// its read loop.
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Dials the backend and starts the read loop.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `options` fail validation
    /// - [`Error::Dial`] / [`Error::DialTimeout`] if the connect fails
    /// - [`Error::Io`] if socket options cannot be applied
    pub async fn dial(options: &PoolOptions) -> Result<Self> {
        options.validate()?;
        Self::connect(options).await
    }

    /// Dials without validating `options` first.
    pub(crate) async fn connect(options: &PoolOptions) -> Result<Self> {
        let stream = socket::dial(options).await?;
        Ok(Self::from_stream(
            stream,
            options.address.clone(),
            options.max_frame_length,
        ))
    }

    /// Wraps an established stream and spawns its read loop.
    fn from_stream(stream: TcpStream, address: String, max_frame_length: usize) -> Self {
        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(Shared {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            address,
            pending: Mutex::new(PendingMap::default()),
            writer: AsyncMutex::new(Some(FramedWrite::new(write_half, LinesCodec::new()))),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            last_error: OnceLock::new(),
        });

        let reader = FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(max_frame_length),
        );
        tokio::spawn(Self::run_read_loop(Arc::clone(&shared), reader));

        Self { shared }
    }

    /// Sends a request and returns a handle for its reply.
    ///
    /// The handle resolves once, with the rendered reply or with
    /// [`Error::ConnectionClosed`] if the connection is torn down first.
    /// Callers that cannot wait indefinitely should use
    /// [`ReplyHandle::timeout`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the request id is empty
    /// - [`Error::DuplicateRequestId`] if the id already has a reply pending
    /// - [`Error::ConnectionClosed`] if the connection is closed
    /// - [`Error::Json`] if the request cannot be serialized
    /// - [`Error::Codec`] if the write fails; the connection should then be
    ///   returned to the pool with this error so it is discarded
    ///
    /// # Cancellation
    ///
    /// Dropping the returned future before it completes may leave a partial
    /// frame behind, so the connection is shut down and reports
    /// [`is_closed`](Self::is_closed).
    pub async fn send(&self, request: &Request) -> Result<ReplyHandle> {
        if request.id.is_empty() {
            return Err(Error::invalid_argument("request id must not be empty"));
        }

        let frame = request.to_frame()?;

        let rx = {
            let mut pending = self.shared.pending.lock();
            // Checked under the lock so close() cannot miss this slot.
            if self.shared.is_closed() {
                return Err(Error::ConnectionClosed);
            }
            if pending.contains_key(&request.id) {
                return Err(Error::duplicate_request_id(&request.id));
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(request.id.clone(), tx);
            rx
        };

        if let Err(e) = self.shared.write_frame(frame).await {
            self.shared.pending.lock().remove(&request.id);
            warn!(conn = self.shared.id, id = %request.id, error = %e, "Request write failed");
            return Err(e);
        }

        trace!(conn = self.shared.id, id = %request.id, "Request sent");

        Ok(ReplyHandle::new(
            request.id.clone(),
            rx,
            Arc::downgrade(&self.shared),
        ))
    }

    /// Closes the connection.
    ///
    /// Stops the read loop, shuts the socket down and resolves every pending
    /// handle with [`Error::ConnectionClosed`]. Bytes still buffered for
    /// writing are dropped, so a backend that has stopped reading cannot
    /// stall it. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the error from shutting down the socket, if any.
    pub async fn close(&self) -> Result<()> {
        self.shared.close().await
    }

    /// Returns `true` once the connection has been closed by its owner or
    /// by its read loop.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Returns the error that stopped the read loop, if any.
    ///
    /// [`Error::StreamEnded`] means the backend closed the stream cleanly.
    #[inline]
    #[must_use]
    pub fn last_error(&self) -> Option<&Error> {
        self.shared.last_error.get()
    }

    /// Returns the number of replies still outstanding.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Returns the process-unique id of this connection.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Returns the backend address this connection dialed.
    #[inline]
    #[must_use]
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Read loop: demultiplexes reply frames until shutdown or stream end.
    async fn run_read_loop(shared: Arc<Shared>, mut reader: LineReader) {
        loop {
            let frame = tokio::select! {
                biased;

                () = shared.shutdown.cancelled() => {
                    trace!(conn = shared.id, "Read loop cancelled");
                    // No-op after an explicit close; finishes the teardown
                    // after an interrupted write or a dropped connection.
                    if let Err(e) = shared.close().await {
                        trace!(conn = shared.id, error = %e, "Close after cancellation");
                    }
                    return;
                }

                frame = reader.next() => frame,
            };

            match frame {
                Some(Ok(line)) => shared.dispatch(&line),
                Some(Err(e)) => {
                    shared.fail(Error::from(e)).await;
                    return;
                }
                None => {
                    shared.fail(Error::StreamEnded).await;
                    return;
                }
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("address", &self.shared.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::future::Future;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use crate::transport::EchoServer;

    const WAIT: Duration = Duration::from_secs(2);

    /// Accepts one connection and hands it to `script`.
    async fn scripted_backend<F, Fut>(script: F) -> PoolOptions
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                script(stream).await;
            }
        });
        PoolOptions::new(address)
    }

    fn reply_line(id: &str, value: &str) -> String {
        let reply = Reply {
            id: id.to_string(),
            value: value.to_string(),
            timestamp: "42".to_string(),
        };
        format!("{}\n", serde_json::to_string(&reply).expect("serialize"))
    }

    async fn echo_connection() -> (EchoServer, Connection) {
        let server = EchoServer::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .await
            .expect("bind");
        let conn = Connection::dial(&PoolOptions::new(server.address()))
            .await
            .expect("dial");
        (server, conn)
    }

    #[tokio::test]
    async fn test_send_receives_rendered_reply() {
        let (_server, conn) = echo_connection().await;

        let handle = conn.send(&Request::new("a", "x")).await.expect("send");
        let value = timeout(WAIT, handle).await.expect("in time").expect("value");

        let (stamp, rest) = value
            .strip_prefix("ts(ns): ")
            .and_then(|v| v.split_once(", "))
            .expect("rendered format");
        assert!(stamp.parse::<u128>().is_ok());
        assert_eq!(rest, "server: hello, x");
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_sends_route_by_id() {
        let (_server, conn) = echo_connection().await;
        let conn = Arc::new(conn);

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move {
                    let request = Request::new(format!("id-{i}"), format!("value-{i}"));
                    let handle = conn.send(&request).await.expect("send");
                    let reply = timeout(WAIT, handle).await.expect("in time").expect("value");
                    assert!(
                        reply.ends_with(&format!("server: hello, value-{i}")),
                        "reply {reply} routed to wrong waiter"
                    );
                })
            })
            .collect();

        for task in tasks {
            task.await.expect("task");
        }
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_replies() {
        let options = scripted_backend(|stream| async move {
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            lines.next_line().await.expect("first");
            lines.next_line().await.expect("second");
            write.write_all(reply_line("b", "second").as_bytes()).await.expect("write");
            write.write_all(reply_line("a", "first").as_bytes()).await.expect("write");
            tokio::time::sleep(WAIT).await;
        })
        .await;
        let conn = Connection::dial(&options).await.expect("dial");

        let a = conn.send(&Request::new("a", "1")).await.expect("send a");
        let b = conn.send(&Request::new("b", "2")).await.expect("send b");

        assert_eq!(timeout(WAIT, a).await.expect("a").expect("value"), "ts(ns): 42, first");
        assert_eq!(timeout(WAIT, b).await.expect("b").expect("value"), "ts(ns): 42, second");
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames_are_skipped() {
        let options = scripted_backend(|stream| async move {
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            lines.next_line().await.expect("request");
            write.write_all(b"this is not json\n").await.expect("write");
            write.write_all(b"\n").await.expect("write");
            write.write_all(reply_line("nobody", "lost").as_bytes()).await.expect("write");
            write.write_all(reply_line("a", "ok").as_bytes()).await.expect("write");
            tokio::time::sleep(WAIT).await;
        })
        .await;
        let conn = Connection::dial(&options).await.expect("dial");

        let handle = conn.send(&Request::new("a", "x")).await.expect("send");
        assert_eq!(timeout(WAIT, handle).await.expect("a").expect("value"), "ts(ns): 42, ok");
        assert!(!conn.is_closed());
        assert!(conn.last_error().is_none());
    }

    #[tokio::test]
    async fn test_stream_end_closes_pending_handles() {
        let options = scripted_backend(|stream| async move {
            let mut lines = BufReader::new(stream).lines();
            lines.next_line().await.expect("request");
            // Dropping the stream ends it.
        })
        .await;
        let conn = Connection::dial(&options).await.expect("dial");

        let handle = conn.send(&Request::new("a", "x")).await.expect("send");
        let result = timeout(WAIT, handle).await.expect("resolved");

        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert!(conn.is_closed());
        assert!(matches!(conn.last_error(), Some(Error::StreamEnded)));
        assert!(matches!(
            conn.send(&Request::new("b", "y")).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_unblocks_waiters_and_is_idempotent() {
        let options = scripted_backend(|stream| async move {
            let _hold = stream;
            tokio::time::sleep(WAIT).await;
        })
        .await;
        let conn = Connection::dial(&options).await.expect("dial");

        let a = conn.send(&Request::new("a", "x")).await.expect("send a");
        let b = conn.send(&Request::new("b", "y")).await.expect("send b");
        assert_eq!(conn.pending_count(), 2);

        conn.close().await.expect("close");
        conn.close().await.expect("second close");

        assert!(matches!(timeout(WAIT, a).await.expect("a"), Err(Error::ConnectionClosed)));
        assert!(matches!(timeout(WAIT, b).await.expect("b"), Err(Error::ConnectionClosed)));
        assert_eq!(conn.pending_count(), 0);
        assert!(conn.last_error().is_none());
    }

    #[tokio::test]
    async fn test_send_rejects_empty_and_duplicate_ids() {
        let options = scripted_backend(|stream| async move {
            let _hold = stream;
            tokio::time::sleep(WAIT).await;
        })
        .await;
        let conn = Connection::dial(&options).await.expect("dial");

        assert!(matches!(
            conn.send(&Request::new("", "x")).await,
            Err(Error::InvalidArgument { .. })
        ));

        let _first = conn.send(&Request::new("a", "x")).await.expect("send");
        let err = conn.send(&Request::new("a", "y")).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateRequestId { ref id } if id == "a"));
        assert_eq!(conn.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_abandons_slot_and_late_reply_is_discarded() {
        let options = scripted_backend(|stream| async move {
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            lines.next_line().await.expect("first request");
            tokio::time::sleep(Duration::from_millis(150)).await;
            write.write_all(reply_line("a", "late").as_bytes()).await.expect("write");
            lines.next_line().await.expect("second request");
            write.write_all(reply_line("a", "fresh").as_bytes()).await.expect("write");
            tokio::time::sleep(WAIT).await;
        })
        .await;
        let conn = Connection::dial(&options).await.expect("dial");

        let handle = conn.send(&Request::new("a", "x")).await.expect("send");
        let err = handle.timeout(Duration::from_millis(20)).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(conn.pending_count(), 0);

        // The late reply arrives with no waiter and is dropped.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!conn.is_closed());

        let handle = conn.send(&Request::new("a", "y")).await.expect("reuse id");
        assert_eq!(timeout(WAIT, handle).await.expect("in time").expect("value"), "ts(ns): 42, fresh");
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let options = scripted_backend(|stream| async move {
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            lines.next_line().await.expect("request");
            let long = "x".repeat(256);
            write.write_all(reply_line("a", &long).as_bytes()).await.expect("write");
            tokio::time::sleep(WAIT).await;
        })
        .await;
        let conn = Connection::dial(&options.with_max_frame_length(64))
            .await
            .expect("dial");

        let handle = conn.send(&Request::new("a", "x")).await.expect("send");
        assert!(matches!(timeout(WAIT, handle).await.expect("resolved"), Err(Error::ConnectionClosed)));
        assert!(matches!(conn.last_error(), Some(Error::Codec(_))));
    }

    /// Larger than loopback socket buffers, so a write to a backend that
    /// never reads cannot complete.
    fn oversized_request(id: &str) -> Request {
        Request::new(id, "x".repeat(32 * 1024 * 1024))
    }

    async fn stalled_backend() -> PoolOptions {
        scripted_backend(|stream| async move {
            let _hold = stream;
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await
    }

    #[tokio::test]
    async fn test_close_does_not_wait_for_stalled_write() {
        let conn = Arc::new(Connection::dial(&stalled_backend().await).await.expect("dial"));
        let waiting = conn.send(&Request::new("a", "x")).await.expect("send a");

        let writer = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.send(&oversized_request("big")).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!writer.is_finished(), "write should be stalled on a full socket");

        timeout(Duration::from_secs(3), conn.close())
            .await
            .expect("close returns while the peer is not reading")
            .expect("close");

        let sent = timeout(WAIT, writer).await.expect("writer released").expect("join");
        assert!(matches!(sent, Err(Error::ConnectionClosed)));
        assert!(matches!(timeout(WAIT, waiting).await.expect("a"), Err(Error::ConnectionClosed)));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_interrupted_send_shuts_connection_down() {
        let conn = Connection::dial(&stalled_backend().await).await.expect("dial");
        let waiting = conn.send(&Request::new("a", "x")).await.expect("send a");

        let interrupted = timeout(Duration::from_millis(300), conn.send(&oversized_request("big"))).await;
        assert!(interrupted.is_err(), "write should not finish against a stalled peer");

        // A partial frame may be buffered, so the connection must not be reused.
        assert!(conn.is_closed());
        assert!(matches!(
            conn.send(&Request::new("b", "y")).await,
            Err(Error::ConnectionClosed)
        ));
        assert!(matches!(timeout(WAIT, waiting).await.expect("a"), Err(Error::ConnectionClosed)));

        timeout(Duration::from_secs(3), conn.close())
            .await
            .expect("close returns while the peer is not reading")
            .expect("close");
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_ids_are_unique() {
        let (server, first) = echo_connection().await;
        let second = Connection::dial(&PoolOptions::new(server.address()))
            .await
            .expect("dial");
        assert_ne!(first.id(), second.id());
        assert_eq!(first.address(), server.address());
    }
}
