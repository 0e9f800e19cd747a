//! Protocol Module
//!
//! Defines the wire protocol shared by client and server.
//!
//! ## Frame Format
//! ```text
//! ┌───────────┬───────────┬──────────────┬───────────┬──────────────┐
//! │ Total (4) │ HLen (4)  │ Header bytes │ BLen (4)  │ Body bytes   │
//! └───────────┴───────────┴──────────────┴───────────┴──────────────┘
//! ```
//!
//! Lengths are u32 little-endian. The header section is a tagged-field
//! record (see [`varint`]); the body is opaque to this crate.
//!
//! ### Status Codes
//! - 200: OK
//! - anything else: remote failure, returned to the caller as data

pub mod varint;
mod frame;
mod header;

pub use frame::{
    encode_frame, encoded_len, peek_total_length, try_decode_frame, Frame, FrameBuffer,
    LENGTH_PREFIX_SIZE, MIN_TOTAL_LENGTH,
};
pub use header::{
    read_sequence, RequestHeader, ResponseHeader, FIELD_COMMAND, FIELD_OPERATION_TYPE,
    FIELD_SEQUENCE, FIELD_STATUS_CODE, FIELD_STATUS_DESCRIPTION, STATUS_OK,
};
pub use varint::{
    decode_fields, decode_varint, encode_string_field, encode_tag, encode_varint,
    encode_varint_field, FieldMap, FieldValue, WireType,
};
