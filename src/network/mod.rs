//! Network Module
//!
//! A small responder server speaking the same frame format as the client.
//!
//! ## Architecture
//! - Single acceptor thread
//! - One thread per accepted connection
//! - Requests handed to a caller-supplied `Handler`

mod server;
mod connection;

pub use server::Server;
pub use connection::{Handler, Reply, Request, ServerConnection};
