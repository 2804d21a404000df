//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForLength`: Need a complete msgpack length prefix (1-9 bytes)
//! - `WaitingForPayload`: Prefix parsed, need N more payload bytes
//!
//! The fixed-size greeting that precedes framed traffic is pulled out with
//! [`FrameBuffer::take_raw`].
//!
//! # Example
//!
//! ```
//! use iproto_client::protocol::{build_frame, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//! let wire = build_frame(&[0x80, 0x80]);
//!
//! // Data arrives in chunks from the socket
//! assert!(buffer.push(&wire[..3]).unwrap().is_empty());
//! let frames = buffer.push(&wire[3..]).unwrap();
//! assert_eq!(frames.len(), 1);
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{decode_length_prefix, DEFAULT_MAX_PAYLOAD_SIZE};
use super::Frame;
use crate::error::{IprotoError, Result};

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for a complete length prefix.
    WaitingForLength,
    /// Prefix consumed, waiting for payload bytes.
    WaitingForPayload { remaining: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// All data is stored in a single `BytesMut` buffer; payloads are split off
/// and frozen without copying.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed packet size.
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max payload: 1GB.
    pub fn new() -> Self {
        Self::with_capacity_and_max_payload(64 * 1024, DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with custom max payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self::with_capacity_and_max_payload(64 * 1024, max_payload_size)
    }

    /// Create a new frame buffer with custom capacity and max payload.
    pub fn with_capacity_and_max_payload(capacity: usize, max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForLength,
            max_payload_size,
        }
    }

    /// Append data to the buffer without extracting frames.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data stays buffered for the next push.
    ///
    /// # Errors
    ///
    /// Returns error on a malformed length prefix or an oversized packet.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.feed(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_frame()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Try to extract a single frame from the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` on protocol violation
    pub fn try_extract_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.state {
                State::WaitingForLength => {
                    let Some((prefix_len, length)) = decode_length_prefix(&self.buffer)? else {
                        return Ok(None);
                    };

                    if length > u64::from(self.max_payload_size) {
                        return Err(IprotoError::Protocol(format!(
                            "Payload size {} exceeds maximum {}",
                            length, self.max_payload_size
                        )));
                    }

                    let _ = self.buffer.split_to(prefix_len);

                    if length == 0 {
                        return Ok(Some(Frame::new(Bytes::new())));
                    }

                    self.state = State::WaitingForPayload {
                        remaining: length as usize,
                    };
                }

                State::WaitingForPayload { remaining } => {
                    if self.buffer.len() < remaining {
                        // Reserve once so the rest of the payload lands without regrowth.
                        self.buffer.reserve(remaining - self.buffer.len());
                        return Ok(None);
                    }

                    let payload = self.buffer.split_to(remaining).freeze();
                    self.state = State::WaitingForLength;

                    return Ok(Some(Frame::new(payload)));
                }
            }
        }
    }

    /// Take exactly `len` unframed bytes from the front of the buffer.
    ///
    /// Used for the greeting. Returns `None` until enough bytes arrived.
    pub fn take_raw(&mut self, len: usize) -> Option<Bytes> {
        if self.buffer.len() < len {
            return None;
        }
        Some(self.buffer.split_to(len).freeze())
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForLength;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForLength => "WaitingForLength",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
