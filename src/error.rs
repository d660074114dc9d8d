//! Error types for argonode
//!
//! We use `thiserror` for structured error types that can be matched on,
//! and `anyhow` for error propagation in application code.

use std::path::PathBuf;

use thiserror::Error;

/// Central error type for node bootstrap operations
#[derive(Error, Debug)]
pub enum NodeError {
    // === Configuration ===
    //
    // The only startup-fatal class: a broken routing document must never
    // reach the protocol engine.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid reserved bytes: expected a 3-element numeric sequence, got {0:?}")]
    InvalidReserved(String),

    // === Process supervision ===
    //
    // The cause lives in the source chain; printing it here too would
    // double it up in alternate renderings.
    #[error("Failed to launch {}", binary.display())]
    Launch {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // === Tunnel discovery ===
    #[error("Tunnel domain not found after {attempts} attempt(s)")]
    DiscoveryExhausted { attempts: u32 },

    #[error("Discovery cancelled")]
    DiscoveryCancelled,

    // === I/O ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using NodeError
pub type Result<T> = std::result::Result<T, NodeError>;
