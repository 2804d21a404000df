//! # iproto-client
//!
//! Async client engine for the Tarantool IPROTO binary protocol.
//!
//! ## Architecture
//!
//! - **Protocol** (sans-io): length-prefixed MessagePack framing, greeting
//!   parsing, `chap-sha1` authentication and the connection state machine
//! - **Codec**: typed requests encoded against a schema snapshot, response
//!   bodies decoded into tuples, scalars and SQL results
//! - **Schema cache**: space/index/field names resolved from `_vspace` and
//!   `_vindex`, refetched when the server reports a schema change
//! - **Connection**: one reader task and one writer task per connection
//!   instance, sync-id correlation for concurrent requests, per-request
//!   deadlines and background reconnects
//!
//! ## Example
//!
//! ```no_run
//! use iproto_client::{Connection, SelectOptions};
//! use rmpv::Value;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> iproto_client::Result<()> {
//!     let conn = Connection::builder()
//!         .username("app")
//!         .password("secret")
//!         .request_timeout(Duration::from_secs(1))
//!         .connect("127.0.0.1:3301")
//!         .await?;
//!
//!     conn.insert("users", vec![Value::from(1), Value::from("alice")], None)
//!         .await?;
//!     let found = conn
//!         .select("users", vec![Value::from(1)], SelectOptions::default(), None)
//!         .await?;
//!     assert_eq!(found.tuples().len(), 1);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod protocol;
pub mod schema;
pub mod transport;

mod client;
mod pending;
mod reconnect;
mod session;
mod writer;

pub use client::{
    Connection, ConnectionBuilder, SelectOptions, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_SCHEMA_RETRY_LIMIT,
};
pub use codec::{Request, Response, ResponseBody, SqlStatement, Tuple, TupleData};
pub use error::{IprotoError, LookupError, Result};
pub use protocol::{Greeting, IteratorType, Version};
pub use reconnect::{ReconnectPolicy, ReconnectState, DEFAULT_RECONNECT_DELAY};
pub use schema::{IndexRef, Schema, SpaceRef};
pub use transport::{BoxFuture, BoxedStream, Connector};
