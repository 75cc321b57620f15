//! One-shot reply handle.
//!
//! [`ReplyHandle`] is returned by [`Connection::send`](super::Connection::send)
//! and resolves exactly once:
//!
//! - `Ok(value)` when the backend's reply for this id arrives
//! - `Err(Error::ConnectionClosed)` when the connection is torn down first

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::debug;

use crate::error::{Error, Result};

use super::connection::Shared;

// ============================================================================
// ReplyHandle
// ============================================================================

/// Pending reply for one request.
///
/// Awaiting the handle consumes it, so a value can be observed at most once.
/// The handle does not keep its connection alive.
#[must_use = "a reply handle does nothing unless awaited"]
pub struct ReplyHandle {
    /// Correlation id of the request.
    id: String,
    /// Receiving half of the reply slot.
    rx: oneshot::Receiver<String>,
    /// Owning connection, used to abandon the slot on timeout.
    owner: Weak<Shared>,
}

impl ReplyHandle {
    pub(crate) fn new(id: String, rx: oneshot::Receiver<String>, owner: Weak<Shared>) -> Self {
        Self { id, rx, owner }
    }

    /// Returns the correlation id this handle waits on.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Checks for a reply without waiting.
    ///
    /// Returns `Ok(None)` while the reply is outstanding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] once the slot is closed, either
    /// because the connection went away or because the value was already
    /// taken.
    pub fn try_recv(&mut self) -> Result<Option<String>> {
        match self.rx.try_recv() {
            Ok(value) => Ok(Some(value)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Closed) => Err(Error::ConnectionClosed),
        }
    }

    /// Waits for the reply for at most `duration`.
    ///
    /// On expiry the pending slot is removed from the connection, so a reply
    /// that arrives later is discarded as an unknown id.
    ///
    /// # Errors
    ///
    /// - [`Error::RequestTimeout`] if no reply arrived in time
    /// - [`Error::ConnectionClosed`] if the connection closed first
    pub async fn timeout(self, duration: Duration) -> Result<String> {
        let id = self.id.clone();
        let owner = self.owner.clone();

        match tokio::time::timeout(duration, self).await {
            Ok(result) => result,
            Err(_) => {
                if let Some(shared) = owner.upgrade() {
                    shared.abandon(&id);
                }
                debug!(id = %id, "Reply wait timed out");
                Err(Error::request_timeout(id, duration))
            }
        }
    }
}

impl Future for ReplyHandle {
    type Output = Result<String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| Error::ConnectionClosed))
    }
}

impl std::fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyHandle").field("id", &self.id).finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
