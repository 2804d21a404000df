//! Wire format constants and header encoding/decoding.
//!
//! Every IPROTO packet after the greeting is framed as:
//! ```text
//! ┌───────────────┬────────────┬──────────┐
//! │ Length prefix │ Header map │ Body map │
//! │ msgpack uint  │ msgpack    │ msgpack  │
//! └───────────────┴────────────┴──────────┘
//! ```
//!
//! The length prefix counts the header and body bytes. The client always
//! writes it as `0xce` followed by a big-endian `u32`.

use rmpv::Value;

use crate::codec::msgpack;
use crate::error::{IprotoError, Result};

/// Size of the length prefix written by the client (`0xce` + u32).
pub const LENGTH_PREFIX_SIZE: usize = 5;

/// Largest length prefix a peer may send (`0xcf` + u64).
pub const MAX_LENGTH_PREFIX_SIZE: usize = 9;

/// Default maximum packet size (header + body), 1 GB.
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1_073_741_824;

/// High bit set in the response code of error responses.
pub const RESPONSE_ERROR_FLAG: u32 = 0x8000;

/// Request type codes.
pub mod request_type {
    pub const OK: u32 = 0x00;
    pub const SELECT: u32 = 0x01;
    pub const INSERT: u32 = 0x02;
    pub const REPLACE: u32 = 0x03;
    pub const UPDATE: u32 = 0x04;
    pub const DELETE: u32 = 0x05;
    pub const CALL_16: u32 = 0x06;
    pub const AUTH: u32 = 0x07;
    pub const EVAL: u32 = 0x08;
    pub const UPSERT: u32 = 0x09;
    pub const CALL: u32 = 0x0a;
    pub const EXECUTE: u32 = 0x0b;
    pub const PREPARE: u32 = 0x0d;
    pub const PING: u32 = 0x40;
    /// Out-of-band push (`box.session.push`), shares the sync of its request.
    pub const CHUNK: u32 = 0x80;
}

/// Header and body map keys.
pub mod keys {
    pub const REQUEST_TYPE: u64 = 0x00;
    pub const SYNC: u64 = 0x01;
    pub const SCHEMA_VERSION: u64 = 0x05;

    pub const SPACE_ID: u64 = 0x10;
    pub const INDEX_ID: u64 = 0x11;
    pub const LIMIT: u64 = 0x12;
    pub const OFFSET: u64 = 0x13;
    pub const ITERATOR: u64 = 0x14;
    pub const INDEX_BASE: u64 = 0x15;
    pub const KEY: u64 = 0x20;
    pub const TUPLE: u64 = 0x21;
    pub const FUNCTION_NAME: u64 = 0x22;
    pub const USER_NAME: u64 = 0x23;
    pub const EXPR: u64 = 0x27;
    pub const OPS: u64 = 0x28;
    pub const DATA: u64 = 0x30;
    pub const ERROR_24: u64 = 0x31;
    pub const METADATA: u64 = 0x32;
    pub const BIND_METADATA: u64 = 0x33;
    pub const BIND_COUNT: u64 = 0x34;
    pub const SQL_TEXT: u64 = 0x40;
    pub const SQL_BIND: u64 = 0x41;
    pub const SQL_INFO: u64 = 0x42;
    pub const STMT_ID: u64 = 0x43;
    pub const ERROR: u64 = 0x52;
}

/// Reserved system space ids used by the schema fetch.
pub mod system_space {
    /// `_vspace`: space metadata visible to the current user.
    pub const VSPACE: u32 = 281;
    /// `_vindex`: index metadata visible to the current user.
    pub const VINDEX: u32 = 289;
}

/// Index iterator kinds for select requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum IteratorType {
    #[default]
    Eq = 0,
    Req = 1,
    All = 2,
    Lt = 3,
    Le = 4,
    Ge = 5,
    Gt = 6,
    BitsAllSet = 7,
    BitsAnySet = 8,
    BitsAllNotSet = 9,
    Overlaps = 10,
    Neighbor = 11,
}

impl IteratorType {
    /// Wire code of this iterator.
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Encode a packet length as a fixed-width msgpack uint32.
#[inline]
pub fn encode_length_prefix(length: u32) -> [u8; LENGTH_PREFIX_SIZE] {
    let mut buf = [0u8; LENGTH_PREFIX_SIZE];
    buf[0] = 0xce;
    buf[1..].copy_from_slice(&length.to_be_bytes());
    buf
}

/// Decode a length prefix from the start of `buf`.
///
/// Returns:
/// - `Ok(Some((prefix_size, length)))` once the full prefix is available
/// - `Ok(None)` if more bytes are needed
/// - `Err(...)` if the first byte is not a msgpack unsigned integer marker
pub fn decode_length_prefix(buf: &[u8]) -> Result<Option<(usize, u64)>> {
    let Some(&marker) = buf.first() else {
        return Ok(None);
    };

    let width = match marker {
        0x00..=0x7f => return Ok(Some((1, u64::from(marker)))),
        0xcc => 1,
        0xcd => 2,
        0xce => 4,
        0xcf => 8,
        other => {
            return Err(IprotoError::Protocol(format!(
                "Invalid length prefix marker 0x{other:02x}"
            )))
        }
    };

    if buf.len() < 1 + width {
        return Ok(None);
    }

    let length = buf[1..=width]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));

    Ok(Some((1 + width, length)))
}

/// Header of an outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub request_type: u32,
    pub sync: u64,
    /// Last schema id observed by the client; omitted until known.
    pub schema_id: Option<u64>,
}

impl RequestHeader {
    /// Create a new request header.
    pub fn new(request_type: u32, sync: u64, schema_id: Option<u64>) -> Self {
        Self {
            request_type,
            sync,
            schema_id,
        }
    }

    /// Append the header map to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let len = if self.schema_id.is_some() { 3 } else { 2 };
        msgpack::write_map_len(buf, len)?;
        msgpack::write_uint(buf, keys::REQUEST_TYPE)?;
        msgpack::write_uint(buf, u64::from(self.request_type))?;
        msgpack::write_uint(buf, keys::SYNC)?;
        msgpack::write_uint(buf, self.sync)?;
        if let Some(schema_id) = self.schema_id {
            msgpack::write_uint(buf, keys::SCHEMA_VERSION)?;
            msgpack::write_uint(buf, schema_id)?;
        }
        Ok(())
    }
}

/// Decoded header of an incoming response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Response code: `0` on success, `0x8000 | errcode` on failure.
    pub code: u32,
    pub sync: u64,
    pub schema_id: Option<u64>,
}

impl ResponseHeader {
    /// Decode the header map, advancing `rd` past it.
    pub fn decode(rd: &mut &[u8]) -> Result<Self> {
        let value = rmpv::decode::read_value(rd)?;
        let Value::Map(entries) = value else {
            return Err(IprotoError::Protocol(
                "Response header is not a map".to_string(),
            ));
        };

        let mut code = None;
        let mut sync = None;
        let mut schema_id = None;

        for (key, value) in &entries {
            match key.as_u64() {
                Some(keys::REQUEST_TYPE) => code = value.as_u64(),
                Some(keys::SYNC) => sync = value.as_u64(),
                Some(keys::SCHEMA_VERSION) => schema_id = value.as_u64(),
                _ => {}
            }
        }

        let code = code
            .and_then(|c| u32::try_from(c).ok())
            .ok_or_else(|| IprotoError::Protocol("Response header has no code".to_string()))?;
        let sync =
            sync.ok_or_else(|| IprotoError::Protocol("Response header has no sync".to_string()))?;

        Ok(Self {
            code,
            sync,
            schema_id,
        })
    }

    /// Check if this is an error response.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.code & RESPONSE_ERROR_FLAG != 0
    }

    /// Server error code with the error flag stripped.
    #[inline]
    pub fn error_code(&self) -> u32 {
        self.code & (RESPONSE_ERROR_FLAG - 1)
    }

    /// Check if this is an out-of-band push rather than the final response.
    #[inline]
    pub fn is_chunk(&self) -> bool {
        self.code == request_type::CHUNK
    }
}
