//! Transport module - how a connection instance gets its byte stream.
//!
//! The engine only needs an `AsyncRead + AsyncWrite` duplex. A [`Connector`]
//! opens a fresh one for every connection attempt, so reconnects go through
//! the same path as the first connect.
//!
//! Provided connectors:
//! - [`TcpConnector`] - TCP with `TCP_NODELAY`
//! - [`UnixConnector`] - Unix domain socket (unix only)

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

mod tcp;
#[cfg(unix)]
mod unix;

pub use tcp::TcpConnector;
#[cfg(unix)]
pub use unix::UnixConnector;

/// Boxed future returned by connectors.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased stream handed to a connection instance.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens byte streams to the server.
pub trait Connector: Send + Sync + 'static {
    /// Open a new stream.
    fn connect(&self) -> BoxFuture<'_, Result<BoxedStream>>;

    /// Peer description for logs.
    fn peer(&self) -> String {
        "<custom>".to_string()
    }
}
