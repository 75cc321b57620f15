//! Pool and connection configuration.
//!
//! Provides a type-safe interface for configuring where connections dial,
//! how many may exist, and how their sockets are set up.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use linepool::PoolOptions;
//!
//! let options = PoolOptions::new("127.0.0.1:3000")
//!     .with_pool_size(5)
//!     .with_dial_timeout(Duration::from_secs(3))
//!     .with_keep_alive(Duration::from_secs(30));
//!
//! options.validate()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default number of connections the pool may hold.
pub const DEFAULT_POOL_SIZE: usize = 5;

/// Default connect timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default read timeout (reserved, not enforced).
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Default upper bound on a single reply line, in bytes.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

// ============================================================================
// PoolOptions
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    /// Backend endpoint as `host:port`.
    pub address: String,

    /// Maximum number of connections (idle + checked out).
    pub pool_size: usize,

    /// Maximum time to wait for a connect to complete.
    pub dial_timeout: Duration,

    /// Reserved. Carried in configuration but not enforced on reads.
    pub read_timeout: Duration,

    /// TCP keep-alive probe interval. `None` disables probing.
    pub keep_alive: Option<Duration>,

    /// Longest reply line accepted before the stream is treated as broken.
    pub max_frame_length: usize,
}

// ============================================================================
// Constructors
// ============================================================================

impl PoolOptions {
    /// Creates options for the given backend address with default settings.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            pool_size: DEFAULT_POOL_SIZE,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            keep_alive: None,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl PoolOptions {
    /// Sets the pool capacity.
    #[inline]
    #[must_use]
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Sets the connect timeout.
    #[inline]
    #[must_use]
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Sets the read timeout.
    #[inline]
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Enables TCP keep-alive probing with the given interval.
    #[inline]
    #[must_use]
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = Some(interval);
        self
    }

    /// Disables TCP keep-alive probing.
    #[inline]
    #[must_use]
    pub fn without_keep_alive(mut self) -> Self {
        self.keep_alive = None;
        self
    }

    /// Sets the maximum accepted reply line length in bytes.
    #[inline]
    #[must_use]
    pub fn with_max_frame_length(mut self, length: usize) -> Self {
        self.max_frame_length = length;
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl PoolOptions {
    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the address is empty, or the pool size,
    /// dial timeout, keep-alive interval or frame limit is zero.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(Error::config("address must not be empty"));
        }
        if self.pool_size == 0 {
            return Err(Error::config("pool size must be greater than zero"));
        }
        if self.dial_timeout.is_zero() {
            return Err(Error::config("dial timeout must be greater than zero"));
        }
        if self.keep_alive.is_some_and(|interval| interval.is_zero()) {
            return Err(Error::config(
                "keep-alive interval must be greater than zero",
            ));
        }
        if self.max_frame_length == 0 {
            return Err(Error::config("max frame length must be greater than zero"));
        }
        Ok(())
    }

    /// Returns `true` if keep-alive probing is enabled.
    #[inline]
    #[must_use]
    pub const fn keep_alive_enabled(&self) -> bool {
        self.keep_alive.is_some()
    }
}

// ============================================================================
// Tests
// ============================================================================
