//! Sans-io connection state machine.
//!
//! ```text
//! Idle ──connect──► Greeting ──greeting──► Authenticating ──auth ok──► Ready
//!                       │                        │                       │
//!                       └────────────┬───────────┴───────────────────────┘
//!                                    ▼
//!                                  Broken
//! ```
//!
//! Without credentials the machine goes straight from `Greeting` to `Ready`.
//! `Broken` is terminal: a new connection gets a new machine.

use bytes::Bytes;
use tracing::debug;

use super::greeting::{Greeting, GREETING_SIZE};
use super::wire_format::ResponseHeader;
use super::{Frame, FrameBuffer};
use crate::codec::{encode_request, BodyKind, Request, ResponseDecoder};
use crate::error::{IprotoError, Result};
use crate::schema::Schema;

/// Sync of the handshake auth request; never handed out to user requests.
pub(crate) const AUTH_SYNC: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Greeting,
    Authenticating,
    Ready,
    Broken,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<hidden>")
            .finish()
    }
}

/// Output of the state machine for the I/O driver.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// Greeting parsed.
    Greeting(Greeting),
    /// Bytes to write to the peer.
    Send(Bytes),
    /// Handshake finished; requests may flow.
    Ready,
    /// A response frame in the `Ready` state.
    Frame(Frame),
}

/// Drives one connection from greeting to steady state.
pub struct CoreProtocol {
    state: ConnectionState,
    buffer: FrameBuffer,
    credentials: Option<Credentials>,
    greeting: Option<Greeting>,
}

impl CoreProtocol {
    pub fn new(credentials: Option<Credentials>, max_payload_size: u32) -> Self {
        Self {
            state: ConnectionState::Idle,
            buffer: FrameBuffer::with_max_payload(max_payload_size),
            credentials,
            greeting: None,
        }
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn greeting(&self) -> Option<&Greeting> {
        self.greeting.as_ref()
    }

    /// The transport is open; wait for the greeting.
    pub fn connect(&mut self) -> Result<()> {
        if self.state != ConnectionState::Idle {
            return Err(IprotoError::Protocol(format!(
                "connect() in state {:?}",
                self.state
            )));
        }
        self.transition(ConnectionState::Greeting);
        Ok(())
    }

    /// Feed bytes read from the transport.
    ///
    /// Any error leaves the machine `Broken`.
    pub fn on_bytes(&mut self, data: &[u8]) -> Result<Vec<ProtocolEvent>> {
        let result = self.process(data);
        if result.is_err() {
            self.transition(ConnectionState::Broken);
        }
        result
    }

    /// The transport reported EOF or an error.
    pub fn on_closed(&mut self) {
        self.transition(ConnectionState::Broken);
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Connection state change");
            self.state = next;
        }
    }

    fn process(&mut self, data: &[u8]) -> Result<Vec<ProtocolEvent>> {
        match self.state {
            ConnectionState::Idle => {
                return Err(IprotoError::Protocol(
                    "Received bytes before connect".to_string(),
                ))
            }
            ConnectionState::Broken => return Err(IprotoError::ConnectionLost),
            _ => {}
        }

        self.buffer.feed(data);
        let mut events = Vec::new();

        loop {
            match self.state {
                ConnectionState::Greeting => {
                    let Some(raw) = self.buffer.take_raw(GREETING_SIZE) else {
                        return Ok(events);
                    };
                    let greeting = Greeting::parse(&raw)?;
                    events.push(ProtocolEvent::Greeting(greeting.clone()));

                    match &self.credentials {
                        Some(credentials) => {
                            let request = Request::Auth {
                                username: credentials.username.clone(),
                                scramble: greeting.scramble(&credentials.password),
                            };
                            let encoded = encode_request(&request, AUTH_SYNC, &Schema::empty())?;
                            events.push(ProtocolEvent::Send(encoded.bytes));
                            self.transition(ConnectionState::Authenticating);
                        }
                        None => {
                            events.push(ProtocolEvent::Ready);
                            self.transition(ConnectionState::Ready);
                        }
                    }
                    self.greeting = Some(greeting);
                }

                ConnectionState::Authenticating => {
                    let Some(frame) = self.buffer.try_extract_frame()? else {
                        return Ok(events);
                    };
                    self.on_auth_response(&frame)?;
                    events.push(ProtocolEvent::Ready);
                    self.transition(ConnectionState::Ready);
                }

                ConnectionState::Ready => {
                    while let Some(frame) = self.buffer.try_extract_frame()? {
                        events.push(ProtocolEvent::Frame(frame));
                    }
                    return Ok(events);
                }

                ConnectionState::Idle | ConnectionState::Broken => return Ok(events),
            }
        }
    }

    fn on_auth_response(&self, frame: &Frame) -> Result<()> {
        let mut rd = frame.payload();
        let header = ResponseHeader::decode(&mut rd)?;
        if header.sync != AUTH_SYNC {
            return Err(IprotoError::Protocol(format!(
                "Unexpected sync {} during authentication",
                header.sync
            )));
        }

        let decoder = ResponseDecoder::new(BodyKind::Empty, None);
        match decoder.decode(header, rd) {
            Ok(_) => Ok(()),
            Err(IprotoError::Server { code, message, .. }) => {
                Err(IprotoError::Auth { code, message })
            }
            Err(other) => Err(other),
        }
    }
}
