//! linepool - Bounded TCP connection pool with request multiplexing.
//!
//! This library keeps a small set of long-lived TCP connections to one
//! backend and lets many concurrent callers share them. Each request carries
//! a correlation id; the backend may answer in any order and every reply is
//! routed to the caller that sent the matching id.
//!
//! # Architecture
//!
//! - **Connection**: one socket, one background read loop, a table of
//!   pending reply slots keyed by id
//! - **Pool**: at most `pool_size` connections, split into idle (FIFO) and
//!   checked out; callers block while the pool is exhausted
//! - **Wire**: one JSON object per line, `{id, value}` out and
//!   `{id, value, timestamp}` back
//!
//! # Quick Start
//!
//! ```no_run
//! use linepool::{Pool, PoolOptions, Request, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let pool = Pool::new(PoolOptions::new("127.0.0.1:3000").with_pool_size(3)).await?;
//!
//!     let conn = pool.get().await?;
//!     let sent = conn.send(&Request::new("pixel-1", "pixelpig!")).await;
//!     pool.put(conn, sent.as_ref().err()).await;
//!
//!     let reply = sent?.await?;
//!     println!("{reply}");
//!
//!     pool.close().await
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`error`] | Error types and [`Result`] alias |
//! | [`options`] | Pool configuration |
//! | [`protocol`] | Request and reply line format |
//! | [`transport`] | Connections, pool, reference backend |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Pool and connection configuration.
pub mod options;

/// Line protocol message types.
pub mod protocol;

/// TCP transport layer.
///
/// Multiplexed connections, the pool that schedules them, and a reference
/// backend.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Error types
pub use error::{Error, Result};

// Configuration
pub use options::PoolOptions;

// Protocol types
pub use protocol::{Reply, Request};

// Transport types
pub use transport::{Connection, ConnectionPool, EchoServer, Pool, ReplyHandle};
