//! Response decoding.
//!
//! The decoder for a response is chosen when its request is encoded, so the
//! reader task never has to know what kind of request a sync belonged to.

use std::sync::Arc;

use rmpv::Value;

use super::msgpack::{map_get_int, value_to_string};
use super::{Tuple, TupleFormat};
use crate::error::{IprotoError, Result};
use crate::protocol::wire_format::{keys, ResponseHeader};

// Keys inside the extended error stack (`keys::ERROR`).
const ERROR_STACK: u64 = 0x00;
const ERROR_TYPE: u64 = 0x00;
const ERROR_MESSAGE: u64 = 0x03;

// Keys inside SQL column metadata and SQL info maps.
const COLUMN_NAME: u64 = 0x00;
const COLUMN_TYPE: u64 = 0x01;
const SQL_ROW_COUNT: u64 = 0x00;
const SQL_AUTOINCREMENT_IDS: u64 = 0x01;

/// SQL result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub field_type: String,
}

/// Outcome of a DML statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlInfo {
    pub row_count: u64,
    pub autoincrement_ids: Vec<i64>,
}

/// Result of an SQL execute: rows for queries, info for DML.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlResult {
    pub metadata: Vec<ColumnMeta>,
    /// Rows carry a format built from the column names.
    pub rows: Vec<Tuple>,
    pub info: Option<SqlInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    pub stmt_id: u64,
    pub bind_count: u32,
    pub bind_metadata: Vec<ColumnMeta>,
    pub metadata: Vec<ColumnMeta>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    Tuples(Vec<Tuple>),
    /// Return values of `call` / `eval`.
    Data(Vec<Value>),
    Sql(SqlResult),
    Prepared(PreparedStatement),
}

/// A successful response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub code: u32,
    pub sync: u64,
    pub schema_id: Option<u64>,
    pub body: ResponseBody,
}

impl Response {
    /// Tuples of a data request, or rows of an SQL query.
    pub fn tuples(&self) -> &[Tuple] {
        match &self.body {
            ResponseBody::Tuples(tuples) => tuples,
            ResponseBody::Sql(result) => &result.rows,
            _ => &[],
        }
    }

    pub fn into_tuples(self) -> Vec<Tuple> {
        match self.body {
            ResponseBody::Tuples(tuples) => tuples,
            ResponseBody::Sql(result) => result.rows,
            _ => Vec::new(),
        }
    }

    /// Return values of `call` / `eval`.
    pub fn data(&self) -> &[Value] {
        match &self.body {
            ResponseBody::Data(values) => values,
            _ => &[],
        }
    }

    /// Body as plain values; tuples become arrays.
    pub fn into_data(self) -> Vec<Value> {
        match self.body {
            ResponseBody::Data(values) => values,
            ResponseBody::Tuples(tuples) => tuples
                .into_iter()
                .map(|t| Value::Array(t.into_values()))
                .collect(),
            ResponseBody::Sql(result) => result
                .rows
                .into_iter()
                .map(|t| Value::Array(t.into_values()))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn sql(&self) -> Option<&SqlResult> {
        match &self.body {
            ResponseBody::Sql(result) => Some(result),
            _ => None,
        }
    }

    pub fn prepared(&self) -> Option<&PreparedStatement> {
        match &self.body {
            ResponseBody::Prepared(statement) => Some(statement),
            _ => None,
        }
    }
}

/// Expected body layout of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyKind {
    Empty,
    Tuples,
    Data,
    Sql,
    Prepared,
}

/// Decodes the response to one specific request.
#[derive(Debug, Clone)]
pub struct ResponseDecoder {
    kind: BodyKind,
    format: Option<Arc<TupleFormat>>,
}

impl ResponseDecoder {
    pub(crate) fn new(kind: BodyKind, format: Option<Arc<TupleFormat>>) -> Self {
        Self { kind, format }
    }

    /// Format attached to decoded tuples.
    pub fn format(&self) -> Option<&Arc<TupleFormat>> {
        self.format.as_ref()
    }

    /// Decode a response body.
    ///
    /// Error responses become `Err` with the server code and message; code
    /// 109 becomes [`IprotoError::SchemaMismatch`].
    pub fn decode(&self, header: ResponseHeader, body: &[u8]) -> Result<Response> {
        let entries = decode_body_map(body)?;

        if header.is_error() {
            return Err(server_error(header.error_code(), &entries));
        }

        let body = match self.kind {
            BodyKind::Empty => ResponseBody::Empty,
            BodyKind::Tuples => ResponseBody::Tuples(
                data_rows(&entries)
                    .into_iter()
                    .map(|row| Tuple::from_row(row, self.format.as_ref()))
                    .collect(),
            ),
            BodyKind::Data => ResponseBody::Data(data_rows(&entries)),
            BodyKind::Sql => ResponseBody::Sql(decode_sql(&entries)),
            BodyKind::Prepared => ResponseBody::Prepared(decode_prepared(&entries)?),
        };

        Ok(Response {
            code: header.code,
            sync: header.sync,
            schema_id: header.schema_id,
            body,
        })
    }
}

fn decode_body_map(body: &[u8]) -> Result<Vec<(Value, Value)>> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let mut rd = body;
    match rmpv::decode::read_value(&mut rd)? {
        Value::Map(entries) => Ok(entries),
        Value::Nil => Ok(Vec::new()),
        other => Err(IprotoError::Protocol(format!(
            "Response body is not a map: {other}"
        ))),
    }
}

fn server_error(code: u32, body: &[(Value, Value)]) -> IprotoError {
    let stack_top = map_get_int(body, keys::ERROR)
        .and_then(Value::as_map)
        .and_then(|stack| map_get_int(stack, ERROR_STACK))
        .and_then(Value::as_array)
        .and_then(|errors| errors.first())
        .and_then(Value::as_map);

    let error_type = stack_top
        .and_then(|e| map_get_int(e, ERROR_TYPE))
        .and_then(value_to_string);
    let message = map_get_int(body, keys::ERROR_24)
        .and_then(value_to_string)
        .or_else(|| {
            stack_top
                .and_then(|e| map_get_int(e, ERROR_MESSAGE))
                .and_then(value_to_string)
        })
        .unwrap_or_else(|| format!("Unknown error {code}"));

    IprotoError::from_server(code, message, error_type)
}

fn data_rows(body: &[(Value, Value)]) -> Vec<Value> {
    match map_get_int(body, keys::DATA) {
        Some(Value::Array(rows)) => rows.clone(),
        _ => Vec::new(),
    }
}

fn decode_columns(body: &[(Value, Value)], key: u64) -> Vec<ColumnMeta> {
    let Some(Value::Array(columns)) = map_get_int(body, key) else {
        return Vec::new();
    };
    columns
        .iter()
        .filter_map(Value::as_map)
        .map(|column| ColumnMeta {
            name: map_get_int(column, COLUMN_NAME)
                .and_then(value_to_string)
                .unwrap_or_default(),
            field_type: map_get_int(column, COLUMN_TYPE)
                .and_then(value_to_string)
                .unwrap_or_default(),
        })
        .collect()
}

fn decode_sql(body: &[(Value, Value)]) -> SqlResult {
    let metadata = decode_columns(body, keys::METADATA);
    let format = (!metadata.is_empty()).then(|| {
        Arc::new(TupleFormat::new(
            metadata.iter().map(|c| c.name.clone()).collect(),
        ))
    });
    let rows = data_rows(body)
        .into_iter()
        .map(|row| Tuple::from_row(row, format.as_ref()))
        .collect();

    let info = map_get_int(body, keys::SQL_INFO)
        .and_then(Value::as_map)
        .map(|info| SqlInfo {
            row_count: map_get_int(info, SQL_ROW_COUNT)
                .and_then(Value::as_u64)
                .unwrap_or(0),
            autoincrement_ids: match map_get_int(info, SQL_AUTOINCREMENT_IDS) {
                Some(Value::Array(ids)) => ids.iter().filter_map(Value::as_i64).collect(),
                _ => Vec::new(),
            },
        });

    SqlResult {
        metadata,
        rows,
        info,
    }
}

fn decode_prepared(body: &[(Value, Value)]) -> Result<PreparedStatement> {
    let stmt_id = map_get_int(body, keys::STMT_ID)
        .and_then(Value::as_u64)
        .ok_or_else(|| IprotoError::Protocol("Prepare response has no statement id".to_string()))?;
    let bind_count = map_get_int(body, keys::BIND_COUNT)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0);

    Ok(PreparedStatement {
        stmt_id,
        bind_count,
        bind_metadata: decode_columns(body, keys::BIND_METADATA),
        metadata: decode_columns(body, keys::METADATA),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::msgpack::write_value;

    fn header(code: u32, sync: u64) -> ResponseHeader {
        ResponseHeader {
            code,
            sync,
            schema_id: Some(7),
        }
    }

    fn body(entries: Vec<(u64, Value)>) -> Vec<u8> {
        let map = Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::from(k), v))
                .collect(),
        );
        let mut buf = Vec::new();
        write_value(&mut buf, &map).unwrap();
        buf
    }

    #[test]
    fn test_tuples_with_format() {
        let format = Arc::new(TupleFormat::new(vec!["id".into(), "name".into()]));
        let decoder = ResponseDecoder::new(BodyKind::Tuples, Some(format));
        let bytes = body(vec![(
            keys::DATA,
            Value::Array(vec![
                Value::Array(vec![Value::from(1), Value::from("a")]),
                Value::Array(vec![Value::from(2), Value::from("b")]),
            ]),
        )]);

        let response = decoder.decode(header(0, 5), &bytes).unwrap();

        assert_eq!(response.sync, 5);
        assert_eq!(response.schema_id, Some(7));
        assert_eq!(response.tuples().len(), 2);
        assert_eq!(
            response.tuples()[1].get_by_name("name"),
            Some(&Value::from("b"))
        );
    }

    #[test]
    fn test_data_body() {
        let decoder = ResponseDecoder::new(BodyKind::Data, None);
        let bytes = body(vec![(
            keys::DATA,
            Value::Array(vec![Value::from(42), Value::Nil]),
        )]);

        let response = decoder.decode(header(0, 1), &bytes).unwrap();
        assert_eq!(response.data(), &[Value::from(42), Value::Nil]);
        assert!(response.tuples().is_empty());
    }

    #[test]
    fn test_empty_body() {
        let decoder = ResponseDecoder::new(BodyKind::Empty, None);
        let response = decoder.decode(header(0, 1), &[]).unwrap();
        assert_eq!(response.body, ResponseBody::Empty);
    }

    #[test]
    fn test_error_24_message() {
        let decoder = ResponseDecoder::new(BodyKind::Tuples, None);
        let bytes = body(vec![(keys::ERROR_24, Value::from("Duplicate key exists"))]);

        let err = decoder.decode(header(0x8000 | 3, 1), &bytes).unwrap_err();
        match err {
            IprotoError::Server {
                code,
                message,
                error_type,
            } => {
                assert_eq!(code, 3);
                assert_eq!(message, "Duplicate key exists");
                assert_eq!(error_type, None);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_error_stack_type() {
        let decoder = ResponseDecoder::new(BodyKind::Data, None);
        let stack = Value::Map(vec![(
            Value::from(ERROR_STACK),
            Value::Array(vec![Value::Map(vec![
                (Value::from(ERROR_TYPE), Value::from("ClientError")),
                (Value::from(ERROR_MESSAGE), Value::from("Procedure 'f' is not defined")),
            ])]),
        )]);
        let bytes = body(vec![(keys::ERROR, stack)]);

        let err = decoder.decode(header(0x8000 | 33, 1), &bytes).unwrap_err();
        match err {
            IprotoError::Server {
                code,
                message,
                error_type,
            } => {
                assert_eq!(code, 33);
                assert_eq!(message, "Procedure 'f' is not defined");
                assert_eq!(error_type.as_deref(), Some("ClientError"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_wrong_schema_version() {
        let decoder = ResponseDecoder::new(BodyKind::Tuples, None);
        let bytes = body(vec![(keys::ERROR_24, Value::from("Wrong schema version"))]);

        let err = decoder.decode(header(0x8000 | 109, 1), &bytes).unwrap_err();
        assert!(err.is_schema_mismatch());
    }

    #[test]
    fn test_sql_query_rows() {
        let decoder = ResponseDecoder::new(BodyKind::Sql, None);
        let column = |name: &str, ty: &str| {
            Value::Map(vec![
                (Value::from(COLUMN_NAME), Value::from(name)),
                (Value::from(COLUMN_TYPE), Value::from(ty)),
            ])
        };
        let bytes = body(vec![
            (
                keys::METADATA,
                Value::Array(vec![column("ID", "integer"), column("NAME", "string")]),
            ),
            (
                keys::DATA,
                Value::Array(vec![Value::Array(vec![Value::from(1), Value::from("x")])]),
            ),
        ]);

        let response = decoder.decode(header(0, 1), &bytes).unwrap();
        let sql = response.sql().unwrap();

        assert_eq!(sql.metadata[1].name, "NAME");
        assert_eq!(sql.metadata[0].field_type, "integer");
        assert_eq!(sql.rows[0].get_by_name("NAME"), Some(&Value::from("x")));
        assert!(sql.info.is_none());
    }

    #[test]
    fn test_sql_dml_info() {
        let decoder = ResponseDecoder::new(BodyKind::Sql, None);
        let info = Value::Map(vec![
            (Value::from(SQL_ROW_COUNT), Value::from(2)),
            (
                Value::from(SQL_AUTOINCREMENT_IDS),
                Value::Array(vec![Value::from(10), Value::from(11)]),
            ),
        ]);
        let bytes = body(vec![(keys::SQL_INFO, info)]);

        let response = decoder.decode(header(0, 1), &bytes).unwrap();
        assert_eq!(
            response.sql().unwrap().info,
            Some(SqlInfo {
                row_count: 2,
                autoincrement_ids: vec![10, 11],
            })
        );
    }

    #[test]
    fn test_prepared_statement() {
        let decoder = ResponseDecoder::new(BodyKind::Prepared, None);
        let bytes = body(vec![
            (keys::STMT_ID, Value::from(77)),
            (keys::BIND_COUNT, Value::from(2)),
            (
                keys::BIND_METADATA,
                Value::Array(vec![Value::Map(vec![
                    (Value::from(COLUMN_NAME), Value::from("?")),
                    (Value::from(COLUMN_TYPE), Value::from("ANY")),
                ])]),
            ),
        ]);

        let response = decoder.decode(header(0, 1), &bytes).unwrap();
        let prepared = response.prepared().unwrap();

        assert_eq!(prepared.stmt_id, 77);
        assert_eq!(prepared.bind_count, 2);
        assert_eq!(prepared.bind_metadata.len(), 1);
        assert!(prepared.metadata.is_empty());
    }

    #[test]
    fn test_non_map_body_is_protocol_error() {
        let decoder = ResponseDecoder::new(BodyKind::Data, None);
        let err = decoder.decode(header(0, 1), &[0x91, 0x01]).unwrap_err();
        assert!(matches!(err, IprotoError::Protocol(_)));
    }
}
