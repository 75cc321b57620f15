//! Shared utilities for demos.
//!
//! Provides common functionality used across all demos:
//! - Command-line argument parsing
//! - Logging initialization

#![allow(dead_code)]

// ============================================================================
// Imports
// ============================================================================

use tracing_subscriber::EnvFilter;

// ============================================================================
// Types
// ============================================================================

/// Command-line arguments for demos.
#[derive(Debug, Clone)]
pub struct Args {
    pub debug: bool,
    pub address: String,
    pub size: usize,
    pub requests: usize,
}

impl Args {
    /// Parse command-line arguments.
    ///
    /// Recognises `--debug`, `--address HOST:PORT`, `--size N` and
    /// `--requests N`.
    pub fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let value_of = |flag: &str| {
            args.iter()
                .position(|a| a == flag)
                .and_then(|i| args.get(i + 1))
                .cloned()
        };

        Self {
            debug: args.iter().any(|a| a == "--debug"),
            address: value_of("--address").unwrap_or_else(|| "127.0.0.1:3000".to_string()),
            size: value_of("--size").and_then(|v| v.parse().ok()).unwrap_or(5),
            requests: value_of("--requests")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        }
    }
}

// ============================================================================
// Functions
// ============================================================================

/// Initialize tracing/logging.
pub fn init_logging(debug: bool) {
    let filter = if debug {
        "linepool=debug,echo_server=debug,pool_demo=debug"
    } else {
        "linepool=info,echo_server=info,pool_demo=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}
