//! Client Module
//!
//! Multiplexed request/response client over one TCP connection.
//!
//! ## Architecture
//! - Callers write whole frames under a write lock
//! - One reader thread per connection routes responses by sequence number
//! - Each caller waits on its own single-slot channel
//!
//! ```text
//!  caller ─┐                         ┌─► slot(seq 1) ─► caller
//!  caller ─┼─► write lock ─► socket ─► reader ─► table ─► slot(seq 2) ─► caller
//!  caller ─┘                         └─► slot(seq 3) ─► caller
//! ```

mod connection;
mod pending;
mod reader;

pub use connection::{CallResult, Connection};
pub use pending::RequestTable;
pub use reader::CloseReason;
