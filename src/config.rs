//! Configuration for seqmux
//!
//! Centralized configuration with sensible defaults. The same struct drives
//! both the client connection and the responder server.

use std::time::Duration;

use crate::error::{MuxError, Result};

/// Main configuration for a seqmux client or server
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Client Configuration
    // -------------------------------------------------------------------------
    /// TCP connect timeout (milliseconds)
    pub connect_timeout_ms: u64,

    /// Default per-call timeout used by `Connection::invoke` (milliseconds)
    pub call_timeout_ms: u64,

    /// Socket write timeout (milliseconds, 0 disables)
    pub write_timeout_ms: u64,

    /// Disable Nagle's algorithm on the socket
    pub nodelay: bool,

    // -------------------------------------------------------------------------
    // Framing Configuration
    // -------------------------------------------------------------------------
    /// Size of each socket read in the reader loop (bytes)
    pub read_buffer_size: usize,

    /// Largest frame accepted or sent, counted from the total_length prefix
    pub max_frame_size: usize,

    /// Consecutive malformed frames tolerated before the connection is closed
    pub max_consecutive_protocol_errors: usize,

    // -------------------------------------------------------------------------
    // Server Configuration
    // -------------------------------------------------------------------------
    /// TCP listen address
    pub listen_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            call_timeout_ms: 5000,
            write_timeout_ms: 5000,
            nodelay: true,
            read_buffer_size: 4096,
            max_frame_size: 16 * 1024 * 1024, // 16 MB
            max_consecutive_protocol_errors: 8,
            listen_addr: "127.0.0.1:7400".to_string(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Write timeout, `None` when disabled
    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_ms > 0).then(|| Duration::from_millis(self.write_timeout_ms))
    }

    /// Reject settings the reader loop cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 {
            return Err(MuxError::Config(
                "connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        // Zero would close the connection on the first malformed frame
        if self.max_consecutive_protocol_errors == 0 {
            return Err(MuxError::Config(
                "max_consecutive_protocol_errors must be at least 1".to_string(),
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(MuxError::Config(
                "read_buffer_size must be greater than zero".to_string(),
            ));
        }
        // Smallest legal frame is an empty header and body: 4 + 4 + 4 bytes
        if self.max_frame_size < 12 {
            return Err(MuxError::Config(format!(
                "max_frame_size must be at least 12 bytes, got {}",
                self.max_frame_size
            )));
        }
        if self.max_frame_size > u32::MAX as usize {
            return Err(MuxError::Config(format!(
                "max_frame_size {} does not fit a u32 length prefix",
                self.max_frame_size
            )));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the connect timeout (in milliseconds)
    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    /// Set the default call timeout (in milliseconds)
    pub fn call_timeout_ms(mut self, ms: u64) -> Self {
        self.config.call_timeout_ms = ms;
        self
    }

    /// Set the write timeout (in milliseconds, 0 disables)
    pub fn write_timeout_ms(mut self, ms: u64) -> Self {
        self.config.write_timeout_ms = ms;
        self
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.config.nodelay = nodelay;
        self
    }

    /// Set the per-read buffer size (in bytes)
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Set the maximum frame size (in bytes)
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set how many malformed frames in a row close the connection
    pub fn max_consecutive_protocol_errors(mut self, count: usize) -> Self {
        self.config.max_consecutive_protocol_errors = count;
        self
    }

    /// Set the TCP listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
