//! # seqmux
//!
//! A multiplexing request/response client over a single TCP connection:
//! - Length-prefixed frames with a tagged-field header
//! - Concurrent callers share one socket
//! - Responses routed back by sequence number, in any order
//! - Per-call timeouts that never disturb other calls
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Callers (any number of threads)            │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ Connection::call
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                     Request Table                           │
//! │          (sequence counter + pending slots, one lock)       │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▲
//!   ┌─────────────┐          ┌─────────────┐
//!   │   Writer    │          │ Reader Loop │
//!   │ (Mutex)     │          │ (1 thread)  │
//!   └──────┬──────┘          └──────┬──────┘
//!          │                        │
//!          ▼                        │
//!   ┌─────────────────────────────────────┐
//!   │              TCP socket             │
//!   └─────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod protocol;
pub mod client;
pub mod table;
pub mod network;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{MuxError, Result};
pub use config::Config;
pub use client::{CallResult, Connection};
pub use table::{Operation, OperationTable};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of seqmux
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
