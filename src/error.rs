//! Error types for seqmux
//!
//! Provides a unified error type for all operations.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using MuxError
pub type Result<T> = std::result::Result<T, MuxError>;

/// Unified error type for seqmux operations
#[derive(Debug, Error)]
pub enum MuxError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Connection Errors
    // -------------------------------------------------------------------------
    /// The socket could not be established, was lost, or has been closed.
    /// Fatal to the connection: every later call fails with this.
    #[error("Connection error: {0}")]
    Connection(String),

    /// No response arrived within the caller's deadline. Recoverable.
    #[error("Request {sequence} timed out after {timeout:?}")]
    Timeout { sequence: u64, timeout: Duration },

    // -------------------------------------------------------------------------
    // Protocol Errors
    // -------------------------------------------------------------------------
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Sequence {0} already has a pending request")]
    DuplicateSequence(u64),

    // -------------------------------------------------------------------------
    // Remote Errors
    // -------------------------------------------------------------------------
    /// Well-formed response carrying a non-OK status.
    #[error("Remote error {status_code}: {description}")]
    Remote { status_code: u32, description: String },

    // -------------------------------------------------------------------------
    // Operation Table Errors
    // -------------------------------------------------------------------------
    #[error("Unknown operation: {service}.{method}")]
    UnknownOperation { service: String, method: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl MuxError {
    /// True if the call ran out of time waiting for its response
    pub fn is_timeout(&self) -> bool {
        matches!(self, MuxError::Timeout { .. })
    }

    /// True if the connection is unusable
    pub fn is_connection(&self) -> bool {
        matches!(self, MuxError::Connection(_))
    }

    /// True for malformed wire data
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            MuxError::Protocol(_) | MuxError::FrameTooLarge { .. }
        )
    }
}

impl From<bincode::Error> for MuxError {
    fn from(e: bincode::Error) -> Self {
        MuxError::Serialization(e.to_string())
    }
}
