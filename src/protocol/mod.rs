//! Protocol module - wire format, framing, greeting and the connection state machine.
//!
//! This module implements the byte-level side of IPROTO:
//! - Length-prefixed framing and header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Greeting parsing and the `chap-sha1` scramble
//! - The sans-io handshake state machine

mod frame;
mod frame_buffer;
pub mod greeting;
mod state;
pub mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use greeting::{Greeting, Version};
pub(crate) use state::AUTH_SYNC;
pub use state::{ConnectionState, CoreProtocol, Credentials, ProtocolEvent};
pub use wire_format::{
    IteratorType, RequestHeader, ResponseHeader, DEFAULT_MAX_PAYLOAD_SIZE, LENGTH_PREFIX_SIZE,
};
