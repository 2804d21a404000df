//! Frame struct: one complete IPROTO packet without its length prefix.
//!
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use iproto_client::protocol::{build_frame, Frame};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(Bytes::from_static(&[0x80, 0x80]));
//! assert_eq!(frame.len(), 2);
//!
//! let wire = build_frame(frame.payload());
//! assert_eq!(wire.len(), 5 + 2);
//! ```

use bytes::Bytes;

use super::wire_format::{encode_length_prefix, LENGTH_PREFIX_SIZE};

/// A complete protocol frame: header map followed by body map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Header and body bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from its payload.
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Build a complete wire packet (length prefix + payload).
pub fn build_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.extend_from_slice(&encode_length_prefix(payload.len() as u32));
    buf.extend_from_slice(payload);
    buf
}
