//! Frame codec
//!
//! Length-prefixed envelope carrying a header section and a body section.
//! All integers are unsigned 32-bit little-endian.
//!
//! ## Wire Format
//! ```text
//! ┌───────────┬───────────┬──────────────┬───────────┬──────────────┐
//! │ Total (4) │ HLen (4)  │ Header bytes │ BLen (4)  │ Body bytes   │
//! └───────────┴───────────┴──────────────┴───────────┴──────────────┘
//!   Total = 4 + HLen + 4 + BLen
//! ```

use std::ops::Range;

use bytes::{Bytes, BytesMut};

use crate::error::{MuxError, Result};

/// Size of each u32 length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Smallest legal total_length: empty header and empty body
pub const MIN_TOTAL_LENGTH: usize = 2 * LENGTH_PREFIX_SIZE;

/// One complete wire-level unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Bytes,
    pub body: Bytes,
}

impl Frame {
    pub fn new(header: impl Into<Bytes>, body: impl Into<Bytes>) -> Self {
        Self {
            header: header.into(),
            body: body.into(),
        }
    }

    /// Bytes this frame occupies on the wire
    pub fn encoded_len(&self) -> usize {
        encoded_len(self.header.len(), self.body.len())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_frame(&self.header, &self.body)
    }
}

/// Wire size of a frame with the given section lengths
pub fn encoded_len(header_len: usize, body_len: usize) -> usize {
    LENGTH_PREFIX_SIZE + MIN_TOTAL_LENGTH + header_len + body_len
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode a header/body pair into a frame
///
/// Fails only if the frame cannot be described by a u32 total_length.
pub fn encode_frame(header: &[u8], body: &[u8]) -> Result<Vec<u8>> {
    let total_len = MIN_TOTAL_LENGTH + header.len() + body.len();
    if total_len > u32::MAX as usize {
        return Err(MuxError::FrameTooLarge {
            size: total_len,
            max: u32::MAX as usize,
        });
    }

    let mut message = Vec::with_capacity(LENGTH_PREFIX_SIZE + total_len);
    message.extend_from_slice(&(total_len as u32).to_le_bytes());
    message.extend_from_slice(&(header.len() as u32).to_le_bytes());
    message.extend_from_slice(header);
    message.extend_from_slice(&(body.len() as u32).to_le_bytes());
    message.extend_from_slice(body);

    Ok(message)
}

// =============================================================================
// Decoding
// =============================================================================

/// Try to decode one frame from the front of an accumulating buffer
///
/// Returns `Ok(None)` if the frame is not yet fully buffered; nothing is
/// consumed in that case. Otherwise returns the frame and the number of
/// bytes it occupied (`4 + total_length`).
///
/// A `Protocol` error is only returned once the whole envelope is buffered;
/// it still occupies `LENGTH_PREFIX_SIZE + peek_total_length(buffer)` bytes,
/// and skipping that many resynchronises on the next frame. `FrameBuffer`
/// does this itself.
pub fn try_decode_frame(buffer: &[u8]) -> Result<Option<(Frame, usize)>> {
    let total_len = match peek_total_length(buffer) {
        Some(len) => len,
        None => return Ok(None),
    };

    let frame_len = LENGTH_PREFIX_SIZE + total_len;
    if buffer.len() < frame_len {
        return Ok(None);
    }

    let envelope = &buffer[..frame_len];
    let (header, body) = split_envelope(envelope)?;
    let frame = Frame {
        header: Bytes::copy_from_slice(&envelope[header]),
        body: Bytes::copy_from_slice(&envelope[body]),
    };

    Ok(Some((frame, frame_len)))
}

/// Read the total_length prefix, if four bytes are available
pub fn peek_total_length(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < LENGTH_PREFIX_SIZE {
        return None;
    }
    let len = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
    Some(len as usize)
}

/// Locate the header and body sections inside one complete envelope
fn split_envelope(envelope: &[u8]) -> Result<(Range<usize>, Range<usize>)> {
    let total_len = envelope.len() - LENGTH_PREFIX_SIZE;
    if total_len < MIN_TOTAL_LENGTH {
        return Err(MuxError::Protocol(format!(
            "Frame total_length {} below minimum {}",
            total_len, MIN_TOTAL_LENGTH
        )));
    }

    let header_len = read_u32_le(envelope, LENGTH_PREFIX_SIZE) as usize;
    let header_start = 2 * LENGTH_PREFIX_SIZE;
    // Header must leave room for the body_length prefix
    if header_len > total_len - MIN_TOTAL_LENGTH {
        return Err(MuxError::Protocol(format!(
            "Frame header_length {} exceeds total_length {}",
            header_len, total_len
        )));
    }
    let header_end = header_start + header_len;

    let body_len = read_u32_le(envelope, header_end) as usize;
    let body_start = header_end + LENGTH_PREFIX_SIZE;
    if body_start + body_len != envelope.len() {
        return Err(MuxError::Protocol(format!(
            "Frame body_length {} disagrees with total_length {} (header_length {})",
            body_len, total_len, header_len
        )));
    }

    Ok((header_start..header_end, body_start..envelope.len()))
}

fn read_u32_le(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

// =============================================================================
// Frame Buffer
// =============================================================================

/// Accumulates socket reads and hands out complete frames
///
/// Frames are split off the buffer without copying their sections.
pub struct FrameBuffer {
    /// Bytes received but not yet consumed as frames
    buffer: BytesMut,

    /// Largest total_length accepted
    max_frame_size: usize,
}

impl FrameBuffer {
    /// Create a buffer that rejects frames larger than `max_frame_size`
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            max_frame_size,
        }
    }

    /// Append freshly read bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Extract the next complete frame
    ///
    /// - `Ok(Some(frame))`: a frame was removed from the buffer
    /// - `Ok(None)`: more bytes are needed, nothing consumed
    /// - `Err(Protocol)`: the frame was malformed and has been discarded;
    ///   the buffer is positioned at the next frame
    /// - `Err(FrameTooLarge)`: the stream cannot be resynchronised
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let total_len = match peek_total_length(&self.buffer) {
            Some(len) => len,
            None => return Ok(None),
        };

        if total_len > self.max_frame_size {
            return Err(MuxError::FrameTooLarge {
                size: total_len,
                max: self.max_frame_size,
            });
        }

        let frame_len = LENGTH_PREFIX_SIZE + total_len;
        if self.buffer.len() < frame_len {
            // Reserve up front so a large frame doesn't grow the buffer per read
            self.buffer.reserve(frame_len - self.buffer.len());
            return Ok(None);
        }

        let envelope = self.buffer.split_to(frame_len).freeze();
        let (header, body) = split_envelope(&envelope)?;

        Ok(Some(Frame {
            header: envelope.slice(header),
            body: envelope.slice(body),
        }))
    }

    /// Bytes buffered but not yet part of a complete frame
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop everything buffered
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
