//! Multiplexed connection
//!
//! The public call surface. Any number of threads may call concurrently on
//! one `Connection`; each call gets its own sequence number and response
//! slot, and frames are written whole under a write lock.
//!
//! Every stage of a call (waiting for the write lock, writing, waiting for
//! the response) draws on the same deadline.

use std::io::{self, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::RecvTimeoutError;
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{MuxError, Result};
use crate::protocol::{encode_frame, Frame, RequestHeader, ResponseHeader, MIN_TOTAL_LENGTH};
use crate::table::OperationTable;
use super::reader::{CloseReason, ReaderLoop};
use super::RequestTable;

/// Outcome of a call that received a well-formed response
///
/// A non-OK status is reported here as data, not as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    /// Sequence number the request was sent with
    pub sequence: u64,

    /// `status_code == STATUS_OK`
    pub success: bool,

    pub status_code: u32,

    pub status_description: String,

    /// Response body, opaque to this crate
    pub body: Bytes,
}

impl CallResult {
    fn from_frame(sequence: u64, frame: Frame) -> Result<Self> {
        let header = ResponseHeader::decode(&frame.header)?;
        Ok(Self {
            sequence,
            success: header.is_ok(),
            status_code: header.status_code,
            status_description: header.status_description,
            body: frame.body,
        })
    }

    /// Turn a non-OK status into `MuxError::Remote`
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(MuxError::Remote {
                status_code: self.status_code,
                description: self.status_description,
            })
        }
    }
}

/// A persistent, multiplexed client connection
pub struct Connection {
    /// Write half; the lock keeps concurrent frames from interleaving
    writer: Mutex<TcpStream>,

    /// Handle used only to shut the socket down from `close`
    control: TcpStream,

    table: Arc<RequestTable>,

    closed: Arc<AtomicBool>,

    reader: Mutex<Option<JoinHandle<CloseReason>>>,

    config: Config,

    peer_addr: String,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.closed)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect with default settings and the given connect timeout
    ///
    /// Sub-millisecond timeouts round up to 1 ms; a zero timeout is rejected
    /// as `MuxError::Config`.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let config = Config::builder()
            .connect_timeout_ms(millis_rounded_up(timeout))
            .build();
        Self::connect_with(host, port, config)
    }

    /// Connect using a full configuration
    ///
    /// Tries every resolved address in turn and starts the reader thread on
    /// the first socket that connects.
    pub fn connect_with(host: &str, port: u16, config: Config) -> Result<Self> {
        config.validate()?;

        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| MuxError::Connection(format!("cannot resolve {}:{}: {}", host, port, e)))?
            .collect();

        let stream = Self::connect_any(&addrs, config.connect_timeout())
            .map_err(|e| MuxError::Connection(format!("cannot connect to {}:{}: {}", host, port, e)))?;

        Self::from_stream(stream, config)
    }

    fn connect_any(addrs: &[SocketAddr], timeout: Duration) -> std::io::Result<TcpStream> {
        let mut last_err = std::io::Error::new(ErrorKind::NotFound, "no addresses resolved");
        for addr in addrs {
            match TcpStream::connect_timeout(addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!("Connect to {} failed: {}", addr, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: TcpStream, config: Config) -> Result<Self> {
        config.validate()?;

        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        stream.set_nodelay(config.nodelay)?;
        stream.set_write_timeout(config.write_timeout())?;
        // Reader blocks until data, EOF, or shutdown
        stream.set_read_timeout(None)?;

        let read_stream = stream.try_clone()?;
        let control = stream.try_clone()?;

        let table = Arc::new(RequestTable::new());
        let closed = Arc::new(AtomicBool::new(false));

        let reader = ReaderLoop::new(
            read_stream,
            Arc::clone(&table),
            Arc::clone(&closed),
            &config,
            peer_addr.clone(),
        );
        let handle = thread::Builder::new()
            .name(format!("seqmux-reader-{}", peer_addr))
            .spawn(move || reader.run())?;

        tracing::debug!("Connected to {}", peer_addr);

        Ok(Self {
            writer: Mutex::new(stream),
            control,
            table,
            closed,
            reader: Mutex::new(Some(handle)),
            config,
            peer_addr,
        })
    }

    /// Send a request and block until its response arrives or `timeout` passes
    ///
    /// `timeout` bounds the whole call, including the wait behind other
    /// callers' writes. A call that times out before any of its bytes reach
    /// the socket leaves the connection usable; one that times out part way
    /// through its frame closes it. Fails fast with `MuxError::Connection`
    /// if the connection is already closed.
    pub fn call(
        &self,
        command: u32,
        operation_type: u32,
        body: &[u8],
        timeout: Duration,
    ) -> Result<CallResult> {
        let deadline = deadline_after(timeout);

        if self.is_closed() {
            return Err(self.closed_error());
        }

        let (sequence, receiver) = self.table.allocate();

        let header = RequestHeader {
            command,
            sequence,
            operation_type,
        }
        .encode();

        let total_len = MIN_TOTAL_LENGTH + header.len() + body.len();
        if total_len > self.config.max_frame_size {
            self.table.evict(sequence);
            return Err(MuxError::FrameTooLarge {
                size: total_len,
                max: self.config.max_frame_size,
            });
        }

        let bytes = match encode_frame(&header, body) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.table.evict(sequence);
                return Err(e);
            }
        };

        if let Err(e) = self.write_frame(&bytes, deadline) {
            self.table.evict(sequence);
            return Err(match e {
                WriteError::Closed => self.closed_error(),
                WriteError::LockTimeout => {
                    tracing::debug!(
                        "Sequence {} timed out waiting for the writer after {:?}",
                        sequence,
                        timeout
                    );
                    MuxError::Timeout { sequence, timeout }
                }
                WriteError::Io { written, error } if is_write_timeout(&error) => {
                    tracing::debug!(
                        "Sequence {} timed out after writing {} of {} bytes",
                        sequence,
                        written,
                        bytes.len()
                    );
                    // A partial frame leaves the stream unframeable
                    if written > 0 {
                        self.mark_closed();
                    }
                    MuxError::Timeout { sequence, timeout }
                }
                WriteError::Io { error, .. } => {
                    self.mark_closed();
                    MuxError::Connection(format!("write to {} failed: {}", self.peer_addr, error))
                }
            });
        }

        tracing::trace!(
            "Sent sequence {} (command {}, operation_type {}, {} body bytes)",
            sequence,
            command,
            operation_type,
            body.len()
        );

        match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(frame) => CallResult::from_frame(sequence, frame),
            Err(RecvTimeoutError::Timeout) => {
                if !self.table.evict(sequence) {
                    // Delivered between the timeout firing and the eviction
                    if let Ok(frame) = receiver.try_recv() {
                        return CallResult::from_frame(sequence, frame);
                    }
                }
                tracing::debug!("Sequence {} timed out after {:?}", sequence, timeout);
                Err(MuxError::Timeout { sequence, timeout })
            }
            Err(RecvTimeoutError::Disconnected) => Err(MuxError::Connection(format!(
                "response slot for sequence {} was dropped",
                sequence
            ))),
        }
    }

    /// Resolve `service.method` in `table` and call it with the configured
    /// default timeout
    pub fn invoke(
        &self,
        table: &OperationTable,
        service: &str,
        method: &str,
        body: &[u8],
    ) -> Result<CallResult> {
        let op = table.lookup(service, method)?;
        self.call(
            op.command,
            op.operation_type,
            body,
            self.config.call_timeout(),
        )
    }

    /// Write one whole frame before `deadline`
    ///
    /// Each send is bounded by the time left, capped by the configured write
    /// timeout, so a peer that stops reading cannot hold the lock past the
    /// caller's deadline.
    fn write_frame(&self, bytes: &[u8], deadline: Instant) -> std::result::Result<(), WriteError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut writer = self
            .writer
            .try_lock_for(remaining)
            .ok_or(WriteError::LockTimeout)?;

        // Another caller may have lost the socket while we waited
        if self.is_closed() {
            return Err(WriteError::Closed);
        }

        let mut written = 0;
        while written < bytes.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(WriteError::Io {
                    written,
                    error: io::Error::new(ErrorKind::TimedOut, "call deadline passed mid-write"),
                });
            }
            let limit = match self.config.write_timeout() {
                Some(cap) => cap.min(remaining),
                None => remaining,
            };
            // Zero is rejected by set_write_timeout
            let limit = limit.max(MIN_SEND_TIMEOUT);
            if let Err(error) = writer.set_write_timeout(Some(limit)) {
                return Err(WriteError::Io { written, error });
            }

            match writer.write(&bytes[written..]) {
                Ok(0) => {
                    return Err(WriteError::Io {
                        written,
                        error: io::Error::new(ErrorKind::WriteZero, "socket accepted no bytes"),
                    });
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(error) => return Err(WriteError::Io { written, error }),
            }
        }

        writer
            .flush()
            .map_err(|error| WriteError::Io { written, error })
    }

    fn closed_error(&self) -> MuxError {
        MuxError::Connection(format!("connection to {} is closed", self.peer_addr))
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.control.shutdown(Shutdown::Both);
        }
    }

    /// Stop the reader thread and release the socket. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        // The reader may already have exited; shutting down again is harmless
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            if e.kind() != ErrorKind::NotConnected {
                tracing::debug!("Shutdown of {} failed: {}", self.peer_addr, e);
            }
        }

        if let Some(handle) = self.reader.lock().take() {
            match handle.join() {
                Ok(reason) => tracing::debug!("Closed {} ({:?})", self.peer_addr, reason),
                Err(_) => tracing::warn!("Reader thread for {} panicked", self.peer_addr),
            }
        }
    }

    /// True once the socket is lost or `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// True if `sequence` is still waiting for a response
    pub fn is_pending(&self, sequence: u64) -> bool {
        self.table.contains(sequence)
    }

    /// Number of requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.table.len()
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Smallest per-send timeout handed to the socket
const MIN_SEND_TIMEOUT: Duration = Duration::from_millis(1);

/// Why a frame did not make it onto the socket
enum WriteError {
    /// The deadline passed while other callers held the writer
    LockTimeout,

    /// The connection closed before this frame was started
    Closed,

    /// The socket failed after `written` bytes of the frame went out
    Io { written: usize, error: io::Error },
}

fn is_write_timeout(error: &io::Error) -> bool {
    matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// `timeout` from now, saturating far in the future for huge timeouts
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 60 * 60))
}

/// Whole milliseconds in `timeout`, rounding any fraction up
fn millis_rounded_up(timeout: Duration) -> u64 {
    let millis = timeout.as_nanos().div_ceil(1_000_000);
    u64::try_from(millis).unwrap_or(u64::MAX)
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
