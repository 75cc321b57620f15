//! TCP transport layer.
//!
//! This module handles communication between the pool and the backend over
//! persistent TCP connections carrying newline-delimited JSON.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐                              ┌─────────────────┐
//! │  Pool            │                              │  Backend        │
//! │   → Connection   │      one JSON per line       │                 │
//! │     send ────────┼─────────────────────────────►│                 │
//! │     read loop ◄──┼──────────────────────────────┤  replies by id, │
//! │     → ReplyHandle│                              │  any order      │
//! └──────────────────┘                              └─────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `Connection::dial` - Connect with timeout, set linger/keep-alive
//! 2. Read loop spawned - demultiplexes replies by correlation id
//! 3. `Connection::send` - Register a reply slot, write one frame
//! 4. `Connection::close` - Stop the loop, close the socket, release waiters
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Multiplexed connection and read loop |
//! | `pool` | Bounded blocking connection pool |
//! | `reply` | One-shot reply handle |
//! | `server` | Reference echo backend |
//! | `socket` | Dialing and socket options |

// ============================================================================
// Submodules
// ============================================================================

/// Multiplexed connection and read loop.
pub mod connection;

/// Bounded blocking connection pool.
pub mod pool;

/// One-shot reply handle.
pub mod reply;

/// Reference echo backend.
pub mod server;

mod socket;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::Connection;
pub use pool::{ConnectionPool, Pool};
pub use reply::ReplyHandle;
pub use server::EchoServer;
