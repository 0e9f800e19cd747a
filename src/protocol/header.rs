//! Header records
//!
//! Request and response headers carried in the header section of a frame,
//! encoded as tagged fields.
//!
//! ### Request Header
//! - field 1: command (varint)
//! - field 2: sequence (varint)
//! - field 3: operation_type (varint)
//!
//! ### Response Header
//! - field 1: command (varint, optional echo)
//! - field 2: sequence (varint)
//! - field 4: status_code (varint)
//! - field 5: status_description (string, optional)

use crate::error::{MuxError, Result};
use super::varint::{decode_fields, encode_string_field, encode_varint_field, FieldMap};

pub const FIELD_COMMAND: u32 = 1;
pub const FIELD_SEQUENCE: u32 = 2;
pub const FIELD_OPERATION_TYPE: u32 = 3;
pub const FIELD_STATUS_CODE: u32 = 4;
pub const FIELD_STATUS_DESCRIPTION: u32 = 5;

/// Status code of a successful response
pub const STATUS_OK: u32 = 200;

/// Header of an outgoing request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub command: u32,
    pub sequence: u64,
    pub operation_type: u32,
}

impl RequestHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = encode_varint_field(FIELD_COMMAND, self.command as u64);
        bytes.extend(encode_varint_field(FIELD_SEQUENCE, self.sequence));
        bytes.extend(encode_varint_field(FIELD_OPERATION_TYPE, self.operation_type as u64));
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let fields = decode_fields(bytes)?;
        Ok(Self {
            command: required_u32(&fields, FIELD_COMMAND, "command")?,
            sequence: required(&fields, FIELD_SEQUENCE, "sequence")?,
            operation_type: required_u32(&fields, FIELD_OPERATION_TYPE, "operation_type")?,
        })
    }
}

/// Header of an incoming response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    pub command: Option<u32>,
    pub sequence: u64,
    pub status_code: u32,
    pub status_description: String,
}

impl ResponseHeader {
    /// Response header with no command echo
    pub fn new(sequence: u64, status_code: u32, status_description: impl Into<String>) -> Self {
        Self {
            command: None,
            sequence,
            status_code,
            status_description: status_description.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status_code == STATUS_OK
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        if let Some(command) = self.command {
            bytes.extend(encode_varint_field(FIELD_COMMAND, command as u64));
        }
        bytes.extend(encode_varint_field(FIELD_SEQUENCE, self.sequence));
        bytes.extend(encode_varint_field(FIELD_STATUS_CODE, self.status_code as u64));
        if !self.status_description.is_empty() {
            bytes.extend(encode_string_field(
                FIELD_STATUS_DESCRIPTION,
                &self.status_description,
            ));
        }
        bytes
    }

    /// Decode a response header
    ///
    /// A missing sequence or status code is a protocol error; the status is
    /// never assumed to be OK.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let fields = decode_fields(bytes)?;
        let command = match fields.varint(FIELD_COMMAND) {
            Some(v) => Some(narrow(v, "command")?),
            None => None,
        };

        Ok(Self {
            command,
            sequence: required(&fields, FIELD_SEQUENCE, "sequence")?,
            status_code: required_u32(&fields, FIELD_STATUS_CODE, "status_code")?,
            status_description: fields
                .string(FIELD_STATUS_DESCRIPTION)?
                .unwrap_or_default(),
        })
    }
}

/// Decode only the sequence number of a header
///
/// Used by the reader loop for routing; other fields are left for the caller.
pub fn read_sequence(header: &[u8]) -> Result<u64> {
    let fields = decode_fields(header)?;
    required(&fields, FIELD_SEQUENCE, "sequence")
}

fn required(fields: &FieldMap, field_number: u32, name: &str) -> Result<u64> {
    fields.varint(field_number).ok_or_else(|| {
        MuxError::Protocol(format!(
            "Header missing {} (field {})",
            name, field_number
        ))
    })
}

fn required_u32(fields: &FieldMap, field_number: u32, name: &str) -> Result<u32> {
    narrow(required(fields, field_number, name)?, name)
}

fn narrow(value: u64, name: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| MuxError::Protocol(format!("Header {} {} exceeds u32", name, value)))
}
