//! Line protocol message types.
//!
//! This module defines the messages exchanged between the pool and the
//! backend.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `Request` | Pool → Backend | `{id, value}` |
//! | `Reply` | Backend → Pool | `{id, value, timestamp}` |
//!
//! Framing is one JSON object per line in both directions. Only `id` is
//! interpreted by the transport; it routes each reply to its waiter.

// ============================================================================
// Submodules
// ============================================================================

/// Request and Reply message types.
pub mod request;

// ============================================================================
// Re-exports
// ============================================================================

pub use request::{Reply, Request};
