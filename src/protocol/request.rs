//! Request and Reply message types.
//!
//! Defines the line format exchanged with the backend. Each message is a
//! single JSON object terminated by `\n`.

// ============================================================================
// Imports
// ============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

// ============================================================================
// Request
// ============================================================================

/// A request from the pool to the backend.
///
/// # Format
///
/// ```json
/// {"id": "pixel-1", "value": "pixelpig!"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, echoed by the backend in its reply.
    pub id: String,

    /// Request payload.
    pub value: String,
}

impl Request {
    /// Creates a request with a caller-chosen id.
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
        }
    }

    /// Creates a request with a random UUID v4 id.
    #[inline]
    #[must_use]
    pub fn generate(value: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), value)
    }

    /// Serializes the request as one frame, without the line terminator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if serialization fails.
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Reply
// ============================================================================

/// A reply from the backend.
///
/// # Format
///
/// ```json
/// {"id": "pixel-1", "value": "server: hello, pixelpig!", "timestamp": "1700000000000000000"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// Matches the request `id`.
    pub id: String,

    /// Reply payload.
    pub value: String,

    /// Decimal nanoseconds since the Unix epoch, as produced by the backend.
    pub timestamp: String,
}

impl Reply {
    /// Creates a reply stamped with the current time.
    #[must_use]
    pub fn now(id: impl Into<String>, value: impl Into<String>) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();

        Self {
            id: id.into(),
            value: value.into(),
            timestamp: nanos.to_string(),
        }
    }

    /// Parses one frame into a reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if the frame is not a
    /// reply object.
    pub fn from_frame(frame: &str) -> Result<Self> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Renders the string delivered to the waiting caller.
    #[must_use]
    pub fn render(&self) -> String {
        format!("ts(ns): {}, {}", self.timestamp, self.value)
    }
}

// ============================================================================
// Tests
// ============================================================================
