//! Error types for iproto-client.

use thiserror::Error;

/// Tarantool error code reported when the client's schema id is stale
/// (`ER_WRONG_SCHEMA_VERSION`).
pub const ER_WRONG_SCHEMA_VERSION: u32 = 109;

/// Main error type for all iproto operations.
#[derive(Debug, Error)]
pub enum IprotoError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error for typed values.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error for typed values.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Malformed dynamic MsgPack value on the wire.
    #[error("MsgPack value error: {0}")]
    ValueDecode(#[from] rmpv::decode::Error),

    /// A typed value did not map to or from a dynamic MsgPack value.
    #[error("MsgPack value conversion error: {0}")]
    ValueConvert(#[from] rmpv::ext::Error),

    /// A request body could not be written. Nothing was sent.
    #[error("Request encode error: {0}")]
    Encode(String),

    /// Wire-format violation (bad length prefix, bad header, bad greeting).
    /// Fatal for the connection that produced it.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Credentials rejected by the server.
    #[error("Authentication failed ({code}): {message}")]
    Auth { code: u32, message: String },

    /// Unknown space, index or field name. Raised before anything is sent.
    #[error("Lookup error: {0}")]
    Lookup(#[from] LookupError),

    /// The server reported a stale schema id after the retry budget was spent.
    #[error("Schema version mismatch: {message}")]
    SchemaMismatch { message: String },

    /// Application error returned by the database.
    #[error("Server error ({code}): {message}")]
    Server {
        code: u32,
        message: String,
        /// Error type from the extended error stack, when the server sends one.
        error_type: Option<String>,
    },

    /// Local deadline elapsed before the response arrived.
    #[error("Request timed out")]
    Timeout,

    /// The write queue stayed full for the whole backpressure timeout.
    #[error("Write queue full")]
    Backpressure,

    /// The connection carrying the request was lost.
    #[error("Connection lost")]
    ConnectionLost,

    /// No ready connection is available.
    #[error("Not connected")]
    NotConnected,
}

/// Name resolution failures against the schema cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("space '{0}' not found")]
    SpaceNotFound(String),

    #[error("index '{index}' not found in space '{space}'")]
    IndexNotFound { space: String, index: String },

    #[error("field '{field}' not found in space '{space}'")]
    FieldNotFound { space: String, field: String },

    #[error("field '{field}' is not a key part of index '{index}'")]
    NotInIndex { index: String, field: String },

    /// A name-keyed payload needs the space format, but none is known.
    #[error("space '{0}' has no format to map field names")]
    NoFormat(String),
}

impl IprotoError {
    /// Build an error from a server error response code and message.
    pub(crate) fn from_server(code: u32, message: String, error_type: Option<String>) -> Self {
        if code == ER_WRONG_SCHEMA_VERSION {
            IprotoError::SchemaMismatch { message }
        } else {
            IprotoError::Server {
                code,
                message,
                error_type,
            }
        }
    }

    /// Check if this error signals a stale schema id.
    #[inline]
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self, IprotoError::SchemaMismatch { .. })
    }

    /// Check if this error is caused by the connection going away.
    #[inline]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            IprotoError::ConnectionLost | IprotoError::NotConnected | IprotoError::Io(_)
        )
    }
}

/// Result type alias using IprotoError.
pub type Result<T> = std::result::Result<T, IprotoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrong_schema_code_maps_to_mismatch() {
        let err = IprotoError::from_server(ER_WRONG_SCHEMA_VERSION, "stale".into(), None);
        assert!(err.is_schema_mismatch());
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_other_codes_stay_server_errors() {
        let err = IprotoError::from_server(3, "Duplicate key exists".into(), None);
        match err {
            IprotoError::Server { code, message, .. } => {
                assert_eq!(code, 3);
                assert_eq!(message, "Duplicate key exists");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_lookup_error_display() {
        let err: IprotoError = LookupError::FieldNotFound {
            space: "users".into(),
            field: "age".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Lookup error: field 'age' not found in space 'users'"
        );
    }
}
