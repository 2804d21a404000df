//! MsgPack helpers.
//!
//! Two layers live here:
//! - [`MsgPackCodec`]: serde-based conversion between user types and
//!   msgpack / [`rmpv::Value`], backed by `rmp-serde`.
//! - crate-internal writers over `rmp::encode` used by the request encoder.
//!
//! Tuples are positional, so structs are encoded as arrays (`to_vec`), not
//! maps (`to_vec_named`).
//!
//! # Example
//!
//! ```
//! use iproto_client::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct User {
//!     id: u32,
//!     name: String,
//! }
//!
//! let user = User { id: 42, name: "alice".to_string() };
//! let value = MsgPackCodec::to_value(&user).unwrap();
//! assert!(value.is_array());
//! let back: User = MsgPackCodec::from_value(value).unwrap();
//! assert_eq!(back, user);
//! ```

use rmpv::Value;

use crate::error::{IprotoError, Result};

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (structs as arrays).
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Convert a serializable value into a dynamic msgpack value.
    pub fn to_value<T: serde::Serialize + ?Sized>(value: &T) -> Result<Value> {
        Ok(rmpv::ext::to_value(value)?)
    }

    /// Convert a dynamic msgpack value into a typed value.
    pub fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
        Ok(rmpv::ext::from_value(value)?)
    }
}

fn encode_error(err: impl std::fmt::Display) -> IprotoError {
    IprotoError::Encode(err.to_string())
}

pub(crate) fn write_map_len(buf: &mut Vec<u8>, len: u32) -> Result<()> {
    rmp::encode::write_map_len(buf, len).map_err(encode_error)?;
    Ok(())
}

pub(crate) fn write_array_len(buf: &mut Vec<u8>, len: u32) -> Result<()> {
    rmp::encode::write_array_len(buf, len).map_err(encode_error)?;
    Ok(())
}

pub(crate) fn write_uint(buf: &mut Vec<u8>, value: u64) -> Result<()> {
    rmp::encode::write_uint(buf, value).map_err(encode_error)?;
    Ok(())
}

pub(crate) fn write_str(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    rmp::encode::write_str(buf, value).map_err(encode_error)
}

/// Write arbitrary bytes with a `str` marker; the auth scramble travels this way.
pub(crate) fn write_raw_str(buf: &mut Vec<u8>, value: &[u8]) -> Result<()> {
    rmp::encode::write_str_len(buf, value.len() as u32).map_err(encode_error)?;
    buf.extend_from_slice(value);
    Ok(())
}

pub(crate) fn write_value(buf: &mut Vec<u8>, value: &Value) -> Result<()> {
    rmpv::encode::write_value(buf, value).map_err(encode_error)
}

pub(crate) fn write_values(buf: &mut Vec<u8>, values: &[Value]) -> Result<()> {
    write_array_len(buf, values.len() as u32)?;
    for value in values {
        write_value(buf, value)?;
    }
    Ok(())
}

/// Find an entry in a msgpack map by integer key.
pub(crate) fn map_get_int(map: &[(Value, Value)], key: u64) -> Option<&Value> {
    map.iter()
        .find(|(k, _)| k.as_u64() == Some(key))
        .map(|(_, v)| v)
}

/// Find an entry in a msgpack map by string key.
pub(crate) fn map_get_str<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

/// Render a msgpack value as text; binary strings are decoded lossily.
pub(crate) fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(match s.as_str() {
            Some(text) => text.to_string(),
            None => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        }),
        Value::Binary(b) => Some(String::from_utf8_lossy(b).into_owned()),
        _ => None,
    }
}
