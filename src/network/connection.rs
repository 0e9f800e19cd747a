//! Server-side connection handler
//!
//! Serves one accepted client: reads request frames and runs the handler
//! for each on its own thread, so slow requests don't hold up fast ones and
//! replies may go out in any order. Reply frames are written whole under a
//! write lock.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{MuxError, Result};
use crate::protocol::{encode_frame, Frame, FrameBuffer, RequestHeader, ResponseHeader, STATUS_OK};

/// A decoded request as seen by a handler
#[derive(Debug, Clone)]
pub struct Request {
    pub header: RequestHeader,
    pub body: Bytes,
}

/// What a handler sends back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status_code: u32,
    pub status_description: String,
    pub body: Vec<u8>,
}

impl Reply {
    /// Create an OK reply
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status_code: STATUS_OK,
            status_description: String::new(),
            body: body.into(),
        }
    }

    /// Create a failure reply with no body
    pub fn error(status_code: u32, description: impl Into<String>) -> Self {
        Self {
            status_code,
            status_description: description.into(),
            body: Vec::new(),
        }
    }
}

/// Request handler; returning `None` withholds the reply entirely
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: &Request) -> Option<Reply>;
}

impl<F> Handler for F
where
    F: Fn(&Request) -> Option<Reply> + Send + Sync + 'static,
{
    fn handle(&self, request: &Request) -> Option<Reply> {
        self(request)
    }
}

/// Handles a single client connection
pub struct ServerConnection {
    stream: TcpStream,

    /// Shared by the per-request threads
    writer: Arc<Mutex<TcpStream>>,

    frames: FrameBuffer,

    read_buffer_size: usize,

    handler: Arc<dyn Handler>,

    /// Peer address for logging
    peer_addr: String,
}

impl ServerConnection {
    /// Create a new connection handler
    pub fn new(stream: TcpStream, handler: Arc<dyn Handler>, config: &Config) -> Result<Self> {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        // Accepted sockets may inherit the listener's non-blocking mode
        stream.set_nonblocking(false)?;
        stream.set_nodelay(config.nodelay)?;
        stream.set_write_timeout(config.write_timeout())?;

        let writer = Arc::new(Mutex::new(stream.try_clone()?));

        Ok(Self {
            stream,
            writer,
            frames: FrameBuffer::new(config.max_frame_size),
            read_buffer_size: config.read_buffer_size,
            handler,
            peer_addr,
        })
    }

    /// Serve until the client disconnects or the stream becomes unframeable
    pub fn handle(&mut self) -> Result<()> {
        tracing::debug!("Connection established from {}", self.peer_addr);
        let mut chunk = vec![0u8; self.read_buffer_size];

        loop {
            let n = match self.stream.read(&mut chunk) {
                Ok(0) => {
                    tracing::debug!("Client {} disconnected", self.peer_addr);
                    return Ok(());
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
                    ) =>
                {
                    tracing::debug!("Connection reset by client {}", self.peer_addr);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            self.frames.extend(&chunk[..n]);

            loop {
                match self.frames.next_frame() {
                    Ok(Some(frame)) => self.serve(frame)?,
                    Ok(None) => break,
                    Err(e @ MuxError::FrameTooLarge { .. }) => return Err(e),
                    Err(e) => {
                        tracing::warn!("Dropping malformed frame from {}: {}", self.peer_addr, e);
                    }
                }
            }
        }
    }

    fn serve(&mut self, frame: Frame) -> Result<()> {
        let header = match RequestHeader::decode(&frame.header) {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!("Bad request header from {}: {}", self.peer_addr, e);
                return Ok(());
            }
        };

        tracing::trace!("Received request from {}: {:?}", self.peer_addr, header);

        let request = Request {
            header,
            body: frame.body,
        };
        let handler = Arc::clone(&self.handler);
        let writer = Arc::clone(&self.writer);
        let peer_addr = self.peer_addr.clone();

        thread::Builder::new()
            .name(format!("seqmux-request-{}", header.sequence))
            .spawn(move || {
                let reply = match handler.handle(&request) {
                    Some(reply) => reply,
                    None => return,
                };
                if let Err(e) = write_reply(&writer, &request.header, reply) {
                    tracing::debug!("Reply to {} failed: {}", peer_addr, e);
                }
            })?;
        Ok(())
    }

    /// Get the peer address string
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }
}

fn write_reply(writer: &Mutex<TcpStream>, request: &RequestHeader, reply: Reply) -> Result<()> {
    let header = ResponseHeader {
        command: Some(request.command),
        sequence: request.sequence,
        status_code: reply.status_code,
        status_description: reply.status_description,
    }
    .encode();

    let bytes = encode_frame(&header, &reply.body)?;
    let mut stream = writer.lock();
    stream.write_all(&bytes)?;
    stream.flush()?;
    Ok(())
}
