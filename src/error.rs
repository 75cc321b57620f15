//! Error types for the connection pool.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use linepool::{Pool, PoolOptions, Request, Result};
//!
//! async fn example(pool: &Pool) -> Result<String> {
//!     let conn = pool.get().await?;
//!     match conn.send(&Request::new("a", "x")).await {
//!         Ok(reply) => {
//!             pool.put(conn, None).await;
//!             reply.await
//!         }
//!         Err(e) => {
//!             pool.put(conn, Some(&e)).await;
//!             Err(e)
//!         }
//!     }
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Dial | [`Error::Dial`], [`Error::DialTimeout`] |
//! | Connection | [`Error::ConnectionClosed`], [`Error::StreamEnded`] |
//! | Request | [`Error::InvalidArgument`], [`Error::DuplicateRequestId`], [`Error::RequestTimeout`] |
//! | Pool | [`Error::PoolClosed`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::Codec`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;
use std::time::Duration;

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when [`PoolOptions`](crate::PoolOptions) fail validation.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Dial Errors
    // ========================================================================
    /// Backend could not be reached.
    #[error("Failed to dial {address}: {source}")]
    Dial {
        /// Address that was dialed.
        address: String,
        /// Underlying connect error.
        #[source]
        source: IoError,
    },

    /// Connect did not complete within the dial timeout.
    #[error("Dial to {address} timed out after {timeout_ms}ms")]
    DialTimeout {
        /// Address that was dialed.
        address: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Connection is closed.
    ///
    /// Returned by `send` on a torn-down connection, and by a reply handle
    /// whose connection closed before the reply arrived.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backend closed the stream without a transport error.
    #[error("Stream ended")]
    StreamEnded,

    // ========================================================================
    // Request Errors
    // ========================================================================
    /// Invalid argument passed to an operation.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// Request id already has a reply outstanding on this connection.
    #[error("Request id already pending: {id}")]
    DuplicateRequestId {
        /// The conflicting correlation id.
        id: String,
    },

    /// Bounded wait for a reply elapsed.
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The request id that timed out.
        request_id: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Pool Errors
    // ========================================================================
    /// Pool has been closed.
    #[error("Pool closed")]
    PoolClosed,

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Line framing error.
    #[error("Framing error: {0}")]
    Codec(#[from] LinesCodecError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a dial error.
    #[inline]
    pub fn dial(address: impl Into<String>, source: IoError) -> Self {
        Self::Dial {
            address: address.into(),
            source,
        }
    }

    /// Creates a dial timeout error.
    #[inline]
    pub fn dial_timeout(address: impl Into<String>, timeout: Duration) -> Self {
        Self::DialTimeout {
            address: address.into(),
            timeout_ms: saturating_millis(timeout),
        }
    }

    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a duplicate request id error.
    #[inline]
    pub fn duplicate_request_id(id: impl Into<String>) -> Self {
        Self::DuplicateRequestId { id: id.into() }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(request_id: impl Into<String>, timeout: Duration) -> Self {
        Self::RequestTimeout {
            request_id: request_id.into(),
            timeout_ms: saturating_millis(timeout),
        }
    }
}

/// Whole milliseconds in `duration`, capped at `u64::MAX`.
fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::DialTimeout { .. } | Self::RequestTimeout { .. }
        )
    }

    /// Returns `true` if this error means the connection is unusable.
    ///
    /// Callers returning a connection to the pool after such an error must
    /// pass it to `put` so the connection is discarded.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Dial { .. }
                | Self::DialTimeout { .. }
                | Self::ConnectionClosed
                | Self::StreamEnded
                | Self::Io(_)
                | Self::Codec(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
