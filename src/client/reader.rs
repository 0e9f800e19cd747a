//! Connection reader loop
//!
//! Sole reader of the socket. Accumulates bytes, cuts them into frames,
//! reads each frame's sequence number and hands the frame to the request
//! table. Runs on one dedicated thread for the life of the connection.
//!
//! Pending requests are not cancelled when the loop exits; their callers
//! time out on their own.

use std::io::{ErrorKind, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::MuxError;
use crate::protocol::{read_sequence, FrameBuffer};
use super::RequestTable;

/// Why the reader loop stopped
#[derive(Debug)]
pub enum CloseReason {
    /// Peer closed the socket
    Eof,

    /// `Connection::close` was called
    Shutdown,

    /// Socket read failed
    Io(std::io::Error),

    /// The byte stream could not be framed any further
    Protocol(MuxError),
}

pub(crate) struct ReaderLoop {
    stream: TcpStream,
    table: Arc<RequestTable>,
    closed: Arc<AtomicBool>,
    frames: FrameBuffer,
    read_buffer_size: usize,
    max_consecutive_errors: usize,
    peer_addr: String,
}

impl ReaderLoop {
    pub(crate) fn new(
        stream: TcpStream,
        table: Arc<RequestTable>,
        closed: Arc<AtomicBool>,
        config: &crate::Config,
        peer_addr: String,
    ) -> Self {
        Self {
            stream,
            table,
            closed,
            frames: FrameBuffer::new(config.max_frame_size),
            read_buffer_size: config.read_buffer_size,
            max_consecutive_errors: config.max_consecutive_protocol_errors,
            peer_addr,
        }
    }

    /// Run until EOF, socket error, or shutdown. Marks the connection closed
    /// and shuts the socket down on the way out.
    pub(crate) fn run(mut self) -> CloseReason {
        let reason = self.read_loop();
        self.closed.store(true, Ordering::SeqCst);
        // Release the socket so writers fail fast; may already be shut down
        let _ = self.stream.shutdown(Shutdown::Both);

        match &reason {
            CloseReason::Eof => tracing::debug!("Peer {} closed the connection", self.peer_addr),
            CloseReason::Shutdown => tracing::debug!("Reader for {} shut down", self.peer_addr),
            CloseReason::Io(e) => tracing::warn!("Read error from {}: {}", self.peer_addr, e),
            CloseReason::Protocol(e) => {
                tracing::warn!("Giving up on stream from {}: {}", self.peer_addr, e)
            }
        }
        reason
    }

    fn read_loop(&mut self) -> CloseReason {
        let mut chunk = vec![0u8; self.read_buffer_size];
        let mut consecutive_errors = 0usize;

        loop {
            let n = match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return if self.closed.load(Ordering::SeqCst) {
                        CloseReason::Shutdown
                    } else {
                        CloseReason::Eof
                    };
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return if self.closed.load(Ordering::SeqCst) {
                        CloseReason::Shutdown
                    } else {
                        CloseReason::Io(e)
                    };
                }
            };

            self.frames.extend(&chunk[..n]);

            loop {
                let frame = match self.frames.next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e @ MuxError::FrameTooLarge { .. }) => return CloseReason::Protocol(e),
                    Err(e) => {
                        consecutive_errors += 1;
                        tracing::warn!("Dropping malformed frame from {}: {}", self.peer_addr, e);
                        if consecutive_errors >= self.max_consecutive_errors {
                            return CloseReason::Protocol(e);
                        }
                        continue;
                    }
                };

                let sequence = match read_sequence(&frame.header) {
                    Ok(sequence) => sequence,
                    Err(e) => {
                        consecutive_errors += 1;
                        tracing::warn!(
                            "Dropping frame with unreadable header from {}: {}",
                            self.peer_addr,
                            e
                        );
                        if consecutive_errors >= self.max_consecutive_errors {
                            return CloseReason::Protocol(e);
                        }
                        continue;
                    }
                };

                consecutive_errors = 0;
                tracing::trace!("Routing response for sequence {}", sequence);
                self.table.deliver(sequence, frame);
            }
        }
    }
}
