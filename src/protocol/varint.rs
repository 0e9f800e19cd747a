//! Varint and tagged-field codec
//!
//! A deliberately small subset of the usual tag-length-value wire encoding,
//! enough to carry the handful of scalar fields in a frame header.
//!
//! ## Field Layout
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────┐
//! │ tag = (field << 3) | wire    │ payload                      │
//! │ (varint)                     │ wire 0: varint               │
//! │                              │ wire 2: varint len + bytes   │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```

use std::collections::BTreeMap;

use crate::error::{MuxError, Result};

/// Longest legal varint for a u64 (ceil(64 / 7))
pub const MAX_VARINT_LEN: usize = 10;

/// Largest field number that fits a tag (29 bits)
pub const MAX_FIELD_NUMBER: u32 = (1 << 29) - 1;

/// Wire types understood by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireType {
    Varint = 0,
    Fixed64 = 1,
    LengthDelimited = 2,
    Fixed32 = 5,
}

impl WireType {
    fn from_tag(tag: u64) -> Result<Self> {
        match tag & 0x07 {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::LengthDelimited),
            5 => Ok(WireType::Fixed32),
            other => Err(MuxError::Protocol(format!(
                "Unsupported wire type {} in tag 0x{:x}",
                other, tag
            ))),
        }
    }
}

/// A decoded field payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Varint(u64),
    Bytes(Vec<u8>),
}

// =============================================================================
// Encoding
// =============================================================================

/// Append a base-128 little-endian varint
pub fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Encode a value as a varint
pub fn encode_varint(value: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAX_VARINT_LEN);
    write_varint(&mut buf, value);
    buf
}

/// Encode a field tag: `(field_number << 3) | wire_type`
pub fn encode_tag(field_number: u32, wire_type: WireType) -> Vec<u8> {
    debug_assert!(field_number > 0 && field_number <= MAX_FIELD_NUMBER);
    encode_varint(((field_number as u64) << 3) | wire_type as u64)
}

/// Encode a varint field: tag followed by the value
pub fn encode_varint_field(field_number: u32, value: u64) -> Vec<u8> {
    let mut buf = encode_tag(field_number, WireType::Varint);
    write_varint(&mut buf, value);
    buf
}

/// Encode a string field: tag, byte length, then the UTF-8 bytes
pub fn encode_string_field(field_number: u32, value: &str) -> Vec<u8> {
    encode_bytes_field(field_number, value.as_bytes())
}

/// Encode an arbitrary length-delimited field
pub fn encode_bytes_field(field_number: u32, value: &[u8]) -> Vec<u8> {
    let mut buf = encode_tag(field_number, WireType::LengthDelimited);
    write_varint(&mut buf, value.len() as u64);
    buf.extend_from_slice(value);
    buf
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode a varint from the front of `bytes`
///
/// Returns the value and the number of bytes consumed
pub fn decode_varint(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;

    for (i, &byte) in bytes.iter().enumerate() {
        if i == MAX_VARINT_LEN {
            break;
        }
        // Tenth byte may only carry the single remaining bit
        if i == MAX_VARINT_LEN - 1 && byte > 0x01 {
            return Err(MuxError::Protocol("Varint overflows u64".to_string()));
        }

        value |= ((byte & 0x7F) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }

    if bytes.len() >= MAX_VARINT_LEN {
        Err(MuxError::Protocol(format!(
            "Varint longer than {} bytes",
            MAX_VARINT_LEN
        )))
    } else {
        Err(MuxError::Protocol(format!(
            "Truncated varint after {} bytes",
            bytes.len()
        )))
    }
}

/// Decoded header record, keyed by field number
///
/// Repeated field numbers keep the last occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    fields: BTreeMap<u32, FieldValue>,
}

impl FieldMap {
    pub fn get(&self, field_number: u32) -> Option<&FieldValue> {
        self.fields.get(&field_number)
    }

    /// Varint value of a field, if present with wire type 0
    pub fn varint(&self, field_number: u32) -> Option<u64> {
        match self.fields.get(&field_number) {
            Some(FieldValue::Varint(v)) => Some(*v),
            _ => None,
        }
    }

    /// Raw bytes of a field, if present with wire type 2
    pub fn bytes(&self, field_number: u32) -> Option<&[u8]> {
        match self.fields.get(&field_number) {
            Some(FieldValue::Bytes(b)) => Some(b.as_slice()),
            _ => None,
        }
    }

    /// UTF-8 string of a length-delimited field
    pub fn string(&self, field_number: u32) -> Result<Option<String>> {
        match self.bytes(field_number) {
            Some(b) => String::from_utf8(b.to_vec()).map(Some).map_err(|e| {
                MuxError::Protocol(format!("Field {} is not valid UTF-8: {}", field_number, e))
            }),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Decode every field in `bytes`
///
/// Fixed-width fields are skipped rather than stored; callers look fields up
/// by number and ignore the rest, so newer senders may add fields freely.
pub fn decode_fields(bytes: &[u8]) -> Result<FieldMap> {
    let mut map = FieldMap::default();
    let mut pos = 0;

    while pos < bytes.len() {
        let (tag, n) = decode_varint(&bytes[pos..])?;
        pos += n;

        let field_number = tag >> 3;
        if field_number == 0 || field_number > MAX_FIELD_NUMBER as u64 {
            return Err(MuxError::Protocol(format!(
                "Invalid field number {}",
                field_number
            )));
        }
        let field_number = field_number as u32;

        match WireType::from_tag(tag)? {
            WireType::Varint => {
                let (value, n) = decode_varint(&bytes[pos..])?;
                pos += n;
                map.fields.insert(field_number, FieldValue::Varint(value));
            }
            WireType::LengthDelimited => {
                let (len, n) = decode_varint(&bytes[pos..])?;
                pos += n;
                let end = checked_end(pos, len, bytes.len(), field_number)?;
                map.fields
                    .insert(field_number, FieldValue::Bytes(bytes[pos..end].to_vec()));
                pos = end;
            }
            WireType::Fixed64 => {
                pos = checked_end(pos, 8, bytes.len(), field_number)?;
            }
            WireType::Fixed32 => {
                pos = checked_end(pos, 4, bytes.len(), field_number)?;
            }
        }
    }

    Ok(map)
}

/// End offset of a `len`-byte payload starting at `pos`, bounds-checked
fn checked_end(pos: usize, len: u64, available: usize, field_number: u32) -> Result<usize> {
    let remaining = available - pos;
    if len > remaining as u64 {
        return Err(MuxError::Protocol(format!(
            "Field {}: payload of {} bytes truncated ({} available)",
            field_number, len, remaining
        )));
    }
    Ok(pos + len as usize)
}
