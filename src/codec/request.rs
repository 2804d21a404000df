//! Request variants and their wire encoding.
//!
//! A request is encoded against a [`Schema`] snapshot: space, index and field
//! names are resolved to numeric ids and positions before any bytes leave the
//! client, so an unknown name fails locally with a lookup error.

use bytes::Bytes;
use rmpv::Value;

use super::msgpack::{
    write_array_len, write_map_len, write_raw_str, write_str, write_uint, write_value,
    write_values,
};
use super::response::{BodyKind, ResponseDecoder};
use crate::error::{IprotoError, LookupError, Result};
use crate::protocol::greeting::SCRAMBLE_SIZE;
use crate::protocol::wire_format::{
    encode_length_prefix, keys, request_type, system_space, IteratorType, RequestHeader,
    LENGTH_PREFIX_SIZE,
};
use crate::schema::{IndexRef, Schema, SchemaSpace, SpaceRef};

/// Auth method name understood by every server version.
const CHAP_SHA1: &str = "chap-sha1";

/// Tuple or key contents, positional or keyed by field name.
#[derive(Debug, Clone, PartialEq)]
pub enum TupleData {
    Positional(Vec<Value>),
    /// Mapped to positions through the space format (tuples) or the index
    /// parts (keys).
    Named(Vec<(String, Value)>),
}

impl Default for TupleData {
    fn default() -> Self {
        TupleData::Positional(Vec::new())
    }
}

impl From<Vec<Value>> for TupleData {
    fn from(values: Vec<Value>) -> Self {
        TupleData::Positional(values)
    }
}

impl From<Vec<(String, Value)>> for TupleData {
    fn from(fields: Vec<(String, Value)>) -> Self {
        TupleData::Named(fields)
    }
}

impl From<Vec<(&str, Value)>> for TupleData {
    fn from(fields: Vec<(&str, Value)>) -> Self {
        TupleData::Named(
            fields
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        )
    }
}

/// SQL statement addressed by text or by prepared statement id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlStatement {
    Text(String),
    Prepared(u64),
}

impl From<&str> for SqlStatement {
    fn from(sql: &str) -> Self {
        SqlStatement::Text(sql.to_string())
    }
}

impl From<String> for SqlStatement {
    fn from(sql: String) -> Self {
        SqlStatement::Text(sql)
    }
}

/// System spaces read by the schema fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemSpace {
    Spaces,
    Indexes,
}

impl SystemSpace {
    fn id(self) -> u32 {
        match self {
            SystemSpace::Spaces => system_space::VSPACE,
            SystemSpace::Indexes => system_space::VINDEX,
        }
    }
}

/// A protocol request. Each variant carries only its own fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Ping,
    Auth {
        username: String,
        scramble: [u8; SCRAMBLE_SIZE],
    },
    Select {
        space: SpaceRef,
        index: IndexRef,
        key: TupleData,
        iterator: IteratorType,
        limit: u32,
        offset: u32,
    },
    Insert {
        space: SpaceRef,
        tuple: TupleData,
    },
    Replace {
        space: SpaceRef,
        tuple: TupleData,
    },
    Update {
        space: SpaceRef,
        index: IndexRef,
        key: TupleData,
        /// Operations like `["=", 2, value]`; a field name in place of the
        /// number is mapped through the space format when it is known.
        ops: Vec<Value>,
    },
    Upsert {
        space: SpaceRef,
        tuple: TupleData,
        ops: Vec<Value>,
    },
    Delete {
        space: SpaceRef,
        index: IndexRef,
        key: TupleData,
    },
    Call {
        function: String,
        args: Vec<Value>,
    },
    /// 1.6-style call: every returned value is wrapped into a tuple.
    Call16 {
        function: String,
        args: Vec<Value>,
    },
    Eval {
        expression: String,
        args: Vec<Value>,
    },
    Execute {
        statement: SqlStatement,
        binds: Vec<Value>,
    },
    Prepare {
        sql: String,
    },
    /// Full scan of `_vspace` or `_vindex`.
    SchemaFetch(SystemSpace),
}

impl Request {
    /// Wire request type code.
    pub fn request_type(&self) -> u32 {
        match self {
            Request::Ping => request_type::PING,
            Request::Auth { .. } => request_type::AUTH,
            Request::Select { .. } | Request::SchemaFetch(_) => request_type::SELECT,
            Request::Insert { .. } => request_type::INSERT,
            Request::Replace { .. } => request_type::REPLACE,
            Request::Update { .. } => request_type::UPDATE,
            Request::Upsert { .. } => request_type::UPSERT,
            Request::Delete { .. } => request_type::DELETE,
            Request::Call { .. } => request_type::CALL,
            Request::Call16 { .. } => request_type::CALL_16,
            Request::Eval { .. } => request_type::EVAL,
            Request::Execute { .. } => request_type::EXECUTE,
            Request::Prepare { .. } => request_type::PREPARE,
        }
    }

    /// Whether the header carries the client's schema id.
    ///
    /// Handshake and schema fetch requests must succeed regardless of the
    /// cached schema, so they never do.
    fn sends_schema_id(&self) -> bool {
        !matches!(
            self,
            Request::Ping | Request::Auth { .. } | Request::SchemaFetch(_)
        )
    }

    /// Whether encoding resolves names through the schema.
    pub fn uses_names(&self) -> bool {
        fn is_named(space: &SpaceRef) -> bool {
            matches!(space, SpaceRef::Name(_))
        }
        match self {
            Request::Select {
                space, index, key, ..
            }
            | Request::Update {
                space, index, key, ..
            }
            | Request::Delete { space, index, key } => {
                is_named(space)
                    || matches!(index, IndexRef::Name(_))
                    || matches!(key, TupleData::Named(_))
            }
            Request::Insert { space, tuple }
            | Request::Replace { space, tuple }
            | Request::Upsert { space, tuple, .. } => {
                is_named(space) || matches!(tuple, TupleData::Named(_))
            }
            _ => false,
        }
    }
}

/// A fully framed request and the decoder for its response.
#[derive(Debug, Clone)]
pub struct EncodedRequest {
    /// Length prefix, header and body.
    pub bytes: Bytes,
    pub decoder: ResponseDecoder,
}

/// Encode `request` with correlation id `sync` against `schema`.
pub fn encode_request(request: &Request, sync: u64, schema: &Schema) -> Result<EncodedRequest> {
    let mut buf = Vec::with_capacity(128);
    buf.extend_from_slice(&encode_length_prefix(0));

    let schema_id = if request.sends_schema_id() {
        schema.id()
    } else {
        None
    };
    RequestHeader::new(request.request_type(), sync, schema_id).encode_into(&mut buf)?;
    let decoder = encode_body(request, schema, &mut buf)?;

    let length = u32::try_from(buf.len() - LENGTH_PREFIX_SIZE).map_err(|_| {
        IprotoError::Protocol(format!("Request of {} bytes is too large", buf.len()))
    })?;
    buf[..LENGTH_PREFIX_SIZE].copy_from_slice(&encode_length_prefix(length));

    Ok(EncodedRequest {
        bytes: Bytes::from(buf),
        decoder,
    })
}

/// A space resolved for one request.
struct Target<'s> {
    id: u32,
    space: Option<&'s SchemaSpace>,
}

impl<'s> Target<'s> {
    fn resolve(schema: &'s Schema, space: &SpaceRef) -> Result<Self> {
        Ok(Self {
            id: schema.space_id(space)?,
            space: schema.lookup_space(space)?.map(|found| found.as_ref()),
        })
    }

    fn decoder(&self) -> ResponseDecoder {
        ResponseDecoder::new(
            BodyKind::Tuples,
            self.space.and_then(|s| s.format()).cloned(),
        )
    }

    fn tuple(&self, label: &SpaceRef, data: &TupleData) -> Result<Vec<Value>> {
        match data {
            TupleData::Positional(values) => Ok(values.clone()),
            TupleData::Named(named) => Ok(self.space_or_no_format(label)?.tuple_from_names(named)?),
        }
    }

    fn key(&self, label: &SpaceRef, index: &IndexRef, data: &TupleData) -> Result<Vec<Value>> {
        match data {
            TupleData::Positional(values) => Ok(values.clone()),
            TupleData::Named(named) => {
                let space = self.space_or_no_format(label)?;
                Ok(space.key_from_names(space.lookup_index(index)?, named)?)
            }
        }
    }

    fn space_or_no_format(&self, label: &SpaceRef) -> Result<&'s SchemaSpace> {
        self.space
            .ok_or_else(|| LookupError::NoFormat(label.to_string()).into())
    }

    /// Replace field names in update operations with their positions.
    fn ops(&self, ops: &[Value]) -> Vec<Value> {
        let Some(format) = self.space.and_then(|s| s.format()) else {
            return ops.to_vec();
        };
        ops.iter()
            .map(|op| match op {
                Value::Array(items) if items.len() >= 2 => {
                    let mut items = items.clone();
                    if let Some(position) = items[1].as_str().and_then(|name| format.position(name))
                    {
                        items[1] = Value::from(position as u64);
                    }
                    Value::Array(items)
                }
                other => other.clone(),
            })
            .collect()
    }
}

fn encode_body(request: &Request, schema: &Schema, buf: &mut Vec<u8>) -> Result<ResponseDecoder> {
    match request {
        Request::Ping => {
            write_map_len(buf, 0)?;
            Ok(ResponseDecoder::new(BodyKind::Empty, None))
        }

        Request::Auth { username, scramble } => {
            write_map_len(buf, 2)?;
            write_uint(buf, keys::USER_NAME)?;
            write_str(buf, username)?;
            write_uint(buf, keys::TUPLE)?;
            write_array_len(buf, 2)?;
            write_str(buf, CHAP_SHA1)?;
            write_raw_str(buf, scramble)?;
            Ok(ResponseDecoder::new(BodyKind::Empty, None))
        }

        Request::Select {
            space,
            index,
            key,
            iterator,
            limit,
            offset,
        } => {
            let target = Target::resolve(schema, space)?;
            let index_id = schema.lookup_index(space, index)?;
            let key = target.key(space, index, key)?;
            write_select(buf, target.id, index_id, &key, *iterator, *limit, *offset)?;
            Ok(target.decoder())
        }

        Request::SchemaFetch(system) => {
            write_select(buf, system.id(), 0, &[], IteratorType::All, u32::MAX, 0)?;
            Ok(ResponseDecoder::new(BodyKind::Tuples, None))
        }

        Request::Insert { space, tuple } | Request::Replace { space, tuple } => {
            let target = Target::resolve(schema, space)?;
            let tuple = target.tuple(space, tuple)?;
            write_map_len(buf, 2)?;
            write_uint(buf, keys::SPACE_ID)?;
            write_uint(buf, u64::from(target.id))?;
            write_uint(buf, keys::TUPLE)?;
            write_values(buf, &tuple)?;
            Ok(target.decoder())
        }

        Request::Update {
            space,
            index,
            key,
            ops,
        } => {
            let target = Target::resolve(schema, space)?;
            let index_id = schema.lookup_index(space, index)?;
            let key = target.key(space, index, key)?;
            write_map_len(buf, 4)?;
            write_uint(buf, keys::SPACE_ID)?;
            write_uint(buf, u64::from(target.id))?;
            write_uint(buf, keys::INDEX_ID)?;
            write_uint(buf, u64::from(index_id))?;
            write_uint(buf, keys::KEY)?;
            write_values(buf, &key)?;
            write_uint(buf, keys::TUPLE)?;
            write_values(buf, &target.ops(ops))?;
            Ok(target.decoder())
        }

        Request::Upsert { space, tuple, ops } => {
            let target = Target::resolve(schema, space)?;
            let tuple = target.tuple(space, tuple)?;
            write_map_len(buf, 3)?;
            write_uint(buf, keys::SPACE_ID)?;
            write_uint(buf, u64::from(target.id))?;
            write_uint(buf, keys::TUPLE)?;
            write_values(buf, &tuple)?;
            write_uint(buf, keys::OPS)?;
            write_values(buf, &target.ops(ops))?;
            Ok(target.decoder())
        }

        Request::Delete { space, index, key } => {
            let target = Target::resolve(schema, space)?;
            let index_id = schema.lookup_index(space, index)?;
            let key = target.key(space, index, key)?;
            write_map_len(buf, 3)?;
            write_uint(buf, keys::SPACE_ID)?;
            write_uint(buf, u64::from(target.id))?;
            write_uint(buf, keys::INDEX_ID)?;
            write_uint(buf, u64::from(index_id))?;
            write_uint(buf, keys::KEY)?;
            write_values(buf, &key)?;
            Ok(target.decoder())
        }

        Request::Call { function, args } => {
            write_call(buf, keys::FUNCTION_NAME, function, args)?;
            Ok(ResponseDecoder::new(BodyKind::Data, None))
        }

        Request::Call16 { function, args } => {
            write_call(buf, keys::FUNCTION_NAME, function, args)?;
            Ok(ResponseDecoder::new(BodyKind::Tuples, None))
        }

        Request::Eval { expression, args } => {
            write_call(buf, keys::EXPR, expression, args)?;
            Ok(ResponseDecoder::new(BodyKind::Data, None))
        }

        Request::Execute { statement, binds } => {
            write_map_len(buf, 2)?;
            match statement {
                SqlStatement::Text(sql) => {
                    write_uint(buf, keys::SQL_TEXT)?;
                    write_str(buf, sql)?;
                }
                SqlStatement::Prepared(stmt_id) => {
                    write_uint(buf, keys::STMT_ID)?;
                    write_uint(buf, *stmt_id)?;
                }
            }
            write_uint(buf, keys::SQL_BIND)?;
            write_values(buf, binds)?;
            Ok(ResponseDecoder::new(BodyKind::Sql, None))
        }

        Request::Prepare { sql } => {
            write_map_len(buf, 1)?;
            write_uint(buf, keys::SQL_TEXT)?;
            write_str(buf, sql)?;
            Ok(ResponseDecoder::new(BodyKind::Prepared, None))
        }
    }
}

fn write_select(
    buf: &mut Vec<u8>,
    space_id: u32,
    index_id: u32,
    key: &[Value],
    iterator: IteratorType,
    limit: u32,
    offset: u32,
) -> Result<()> {
    write_map_len(buf, 6)?;
    write_uint(buf, keys::SPACE_ID)?;
    write_uint(buf, u64::from(space_id))?;
    write_uint(buf, keys::INDEX_ID)?;
    write_uint(buf, u64::from(index_id))?;
    write_uint(buf, keys::LIMIT)?;
    write_uint(buf, u64::from(limit))?;
    write_uint(buf, keys::OFFSET)?;
    write_uint(buf, u64::from(offset))?;
    write_uint(buf, keys::ITERATOR)?;
    write_uint(buf, u64::from(iterator.code()))?;
    write_uint(buf, keys::KEY)?;
    write_values(buf, key)
}

fn write_call(buf: &mut Vec<u8>, name_key: u64, name: &str, args: &[Value]) -> Result<()> {
    write_map_len(buf, 2)?;
    write_uint(buf, name_key)?;
    write_str(buf, name)?;
    write_uint(buf, keys::TUPLE)?;
    write_array_len(buf, args.len() as u32)?;
    for arg in args {
        write_value(buf, arg)?;
    }
    Ok(())
}
