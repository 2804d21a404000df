//! Tuples and their field formats.
//!
//! A [`Tuple`] is a positional row as returned by the server. When the
//! request was resolved against a known space (or an SQL result carried
//! column metadata), the tuple also carries a [`TupleFormat`] so fields can be
//! read by name.

use std::collections::HashMap;
use std::sync::Arc;

use rmpv::Value;
use serde::de::DeserializeOwned;

use super::MsgPackCodec;
use crate::error::Result;

/// Ordered field names with a name → position index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TupleFormat {
    names: Vec<String>,
    positions: HashMap<String, usize>,
}

impl TupleFormat {
    /// Build a format from field names in tuple order.
    ///
    /// A duplicated name resolves to its first position.
    pub fn new(names: Vec<String>) -> Self {
        let mut positions = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            positions.entry(name.clone()).or_insert(i);
        }
        Self { names, positions }
    }

    /// Position of a field name.
    #[inline]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    /// Field name at a position.
    #[inline]
    pub fn name(&self, position: usize) -> Option<&str> {
        self.names.get(position).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// A positional row, optionally paired with its field format.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    values: Vec<Value>,
    format: Option<Arc<TupleFormat>>,
}

impl Tuple {
    pub fn new(values: Vec<Value>, format: Option<Arc<TupleFormat>>) -> Self {
        Self { values, format }
    }

    /// Build a tuple from a decoded row; non-array rows become one-field tuples.
    pub(crate) fn from_row(row: Value, format: Option<&Arc<TupleFormat>>) -> Self {
        let values = match row {
            Value::Array(values) => values,
            other => vec![other],
        };
        Self::new(values, format.cloned())
    }

    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Field by position.
    #[inline]
    pub fn get(&self, position: usize) -> Option<&Value> {
        self.values.get(position)
    }

    /// Field by name; `None` without a format or for unknown names.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        let position = self.format.as_ref()?.position(name)?;
        self.values.get(position)
    }

    pub fn format(&self) -> Option<&Arc<TupleFormat>> {
        self.format.as_ref()
    }

    /// Name-keyed view of the tuple, in field order.
    ///
    /// Values past the end of the format have no name and are left out.
    pub fn to_record(&self) -> Option<Vec<(String, Value)>> {
        let format = self.format.as_ref()?;
        Some(
            self.values
                .iter()
                .enumerate()
                .filter_map(|(i, value)| format.name(i).map(|n| (n.to_string(), value.clone())))
                .collect(),
        )
    }

    /// Deserialize the tuple into a typed value (e.g. a struct or a tuple).
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::from_value(Value::Array(self.values.clone()))
    }
}
