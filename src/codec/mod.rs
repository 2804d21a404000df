//! Codec module - request encoding, response decoding and tuple values.
//!
//! - [`encode_request`] - typed [`Request`] + schema snapshot → framed bytes
//! - [`ResponseDecoder`] - frame body → typed [`Response`]
//! - [`Tuple`] / [`TupleFormat`] - positional rows with optional field names
//! - [`MsgPackCodec`] - serde bridge for user types (`rmp-serde`)
//!
//! # Example
//!
//! ```
//! use iproto_client::codec::{encode_request, Request};
//! use iproto_client::schema::Schema;
//!
//! let encoded = encode_request(&Request::Ping, 1, &Schema::empty()).unwrap();
//! // 0xce + u32 length, then the header and body maps
//! assert_eq!(encoded.bytes[0], 0xce);
//! ```

pub(crate) mod msgpack;
mod request;
mod response;
mod tuple;

pub use msgpack::MsgPackCodec;
pub use request::{encode_request, EncodedRequest, Request, SqlStatement, SystemSpace, TupleData};
pub(crate) use response::BodyKind;
pub use response::{
    ColumnMeta, PreparedStatement, Response, ResponseBody, ResponseDecoder, SqlInfo, SqlResult,
};
pub use tuple::{Tuple, TupleFormat};
