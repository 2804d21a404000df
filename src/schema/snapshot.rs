//! Immutable schema snapshot built from `_vspace` / `_vindex` rows.

use std::collections::HashMap;
use std::sync::Arc;

use rmpv::Value;
use tracing::warn;

use super::{IndexRef, SpaceRef};
use crate::codec::msgpack::{map_get_str, value_to_string};
use crate::codec::{Tuple, TupleFormat};
use crate::error::LookupError;

/// One entry of a space format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub field_type: String,
    pub is_nullable: bool,
}

/// One key part of an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPart {
    /// Zero-based tuple position.
    pub field_no: u32,
    pub field_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaIndex {
    pub id: u32,
    pub name: String,
    /// `TREE`, `HASH`, `RTREE`, `BITSET`.
    pub index_type: String,
    pub unique: bool,
    pub parts: Vec<IndexPart>,
}

/// A space with its format and indexes.
#[derive(Debug, Clone)]
pub struct SchemaSpace {
    pub id: u32,
    pub name: String,
    pub engine: String,
    pub field_count: u32,
    pub temporary: bool,
    pub fields: Vec<Field>,
    format: Arc<TupleFormat>,
    indexes: HashMap<u32, SchemaIndex>,
    index_names: HashMap<String, u32>,
}

impl SchemaSpace {
    /// Field format, `None` when the space declares no field names.
    pub fn format(&self) -> Option<&Arc<TupleFormat>> {
        if self.format.is_empty() {
            None
        } else {
            Some(&self.format)
        }
    }

    pub fn indexes(&self) -> impl Iterator<Item = &SchemaIndex> {
        self.indexes.values()
    }

    pub fn lookup_index(&self, index: &IndexRef) -> Result<&SchemaIndex, LookupError> {
        let found = match index {
            IndexRef::Id(id) => self.indexes.get(id),
            IndexRef::Name(name) => self
                .index_names
                .get(name)
                .and_then(|id| self.indexes.get(id)),
        };
        found.ok_or_else(|| LookupError::IndexNotFound {
            space: self.name.clone(),
            index: index.to_string(),
        })
    }

    pub fn resolve_field(&self, field: &str) -> Result<usize, LookupError> {
        if self.format.is_empty() {
            return Err(LookupError::NoFormat(self.name.clone()));
        }
        self.format
            .position(field)
            .ok_or_else(|| LookupError::FieldNotFound {
                space: self.name.clone(),
                field: field.to_string(),
            })
    }

    /// Lay out name-keyed values positionally.
    ///
    /// The result is as long as the highest named position; gaps are `nil`.
    pub fn tuple_from_names(&self, named: &[(String, Value)]) -> Result<Vec<Value>, LookupError> {
        let mut tuple = Vec::with_capacity(self.format.len());
        for (name, value) in named {
            let position = self.resolve_field(name)?;
            if tuple.len() <= position {
                tuple.resize(position + 1, Value::Nil);
            }
            tuple[position] = value.clone();
        }
        Ok(tuple)
    }

    /// Build an index key from name-keyed values, following the index parts.
    ///
    /// Supplied names must form a prefix of the index parts.
    pub fn key_from_names(
        &self,
        index: &SchemaIndex,
        named: &[(String, Value)],
    ) -> Result<Vec<Value>, LookupError> {
        let mut by_position = HashMap::with_capacity(named.len());
        for (name, value) in named {
            by_position.insert(self.resolve_field(name)?, (name, value));
        }

        let mut key = Vec::with_capacity(named.len());
        for part in &index.parts {
            match by_position.remove(&(part.field_no as usize)) {
                Some((_, value)) => key.push(value.clone()),
                None => break,
            }
        }

        if let Some((name, _)) = by_position.into_values().next() {
            return Err(LookupError::NotInIndex {
                index: index.name.clone(),
                field: name.clone(),
            });
        }
        Ok(key)
    }
}

/// Snapshot of all spaces visible to the session user.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    id: Option<u64>,
    spaces: HashMap<u32, Arc<SchemaSpace>>,
    space_names: HashMap<String, u32>,
}

impl Schema {
    /// Schema before the first fetch: no id, no spaces.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from raw `_vspace` and `_vindex` rows.
    ///
    /// Rows that do not have the expected layout are skipped.
    pub fn from_rows(schema_id: Option<u64>, space_rows: &[Tuple], index_rows: &[Tuple]) -> Self {
        let mut spaces: HashMap<u32, SchemaSpace> = HashMap::with_capacity(space_rows.len());
        for row in space_rows {
            match parse_space(row) {
                Some(space) => {
                    spaces.insert(space.id, space);
                }
                None => warn!(row = ?row.values(), "Skipping malformed _vspace row"),
            }
        }

        for row in index_rows {
            let Some((space_id, index)) = parse_index(row) else {
                warn!(row = ?row.values(), "Skipping malformed _vindex row");
                continue;
            };
            if let Some(space) = spaces.get_mut(&space_id) {
                space.index_names.insert(index.name.clone(), index.id);
                space.indexes.insert(index.id, index);
            }
        }

        let space_names = spaces
            .values()
            .map(|space| (space.name.clone(), space.id))
            .collect();
        let spaces = spaces
            .into_iter()
            .map(|(id, space)| (id, Arc::new(space)))
            .collect();

        Self {
            id: schema_id,
            spaces,
            space_names,
        }
    }

    /// Server schema id this snapshot was fetched at.
    #[inline]
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }

    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    pub fn spaces(&self) -> impl Iterator<Item = &Arc<SchemaSpace>> {
        self.spaces.values()
    }

    pub fn space_by_id(&self, id: u32) -> Option<&Arc<SchemaSpace>> {
        self.spaces.get(&id)
    }

    pub fn space_by_name(&self, name: &str) -> Option<&Arc<SchemaSpace>> {
        self.space_names.get(name).and_then(|id| self.spaces.get(id))
    }

    /// Find a space.
    ///
    /// A numeric id that is not in the snapshot is still usable on the wire,
    /// so it yields `Ok(None)`. An unknown name is an error.
    pub fn lookup_space(&self, space: &SpaceRef) -> Result<Option<&Arc<SchemaSpace>>, LookupError> {
        match space {
            SpaceRef::Id(id) => Ok(self.spaces.get(id)),
            SpaceRef::Name(name) => self
                .space_by_name(name)
                .map(Some)
                .ok_or_else(|| LookupError::SpaceNotFound(name.clone())),
        }
    }

    pub fn space_id(&self, space: &SpaceRef) -> Result<u32, LookupError> {
        match space {
            SpaceRef::Id(id) => Ok(*id),
            SpaceRef::Name(name) => self
                .space_by_name(name)
                .map(|found| found.id)
                .ok_or_else(|| LookupError::SpaceNotFound(name.clone())),
        }
    }

    pub fn lookup_index(&self, space: &SpaceRef, index: &IndexRef) -> Result<u32, LookupError> {
        let resolved = self.lookup_space(space)?;
        match (index, resolved) {
            (IndexRef::Id(id), _) => Ok(*id),
            (IndexRef::Name(_), Some(found)) => Ok(found.lookup_index(index)?.id),
            (IndexRef::Name(name), None) => Err(LookupError::IndexNotFound {
                space: space.to_string(),
                index: name.clone(),
            }),
        }
    }

    pub fn resolve_field(&self, space: &SpaceRef, field: &str) -> Result<usize, LookupError> {
        match self.lookup_space(space)? {
            Some(found) => found.resolve_field(field),
            None => Err(LookupError::NoFormat(space.to_string())),
        }
    }
}

fn as_u32(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|n| u32::try_from(n).ok())
}

// _vspace: [id, owner, name, engine, field_count, flags, format]
fn parse_space(row: &Tuple) -> Option<SchemaSpace> {
    let id = as_u32(row.get(0)?)?;
    let name = value_to_string(row.get(2)?)?;
    let engine = row.get(3).and_then(value_to_string).unwrap_or_default();
    let field_count = row.get(4).and_then(as_u32).unwrap_or(0);
    let temporary = row.get(5).map_or(false, is_temporary);
    let fields: Vec<Field> = match row.get(6) {
        Some(Value::Array(items)) => items.iter().filter_map(parse_field).collect(),
        _ => Vec::new(),
    };
    let format = Arc::new(TupleFormat::new(
        fields.iter().map(|f| f.name.clone()).collect(),
    ));

    Some(SchemaSpace {
        id,
        name,
        engine,
        field_count,
        temporary,
        fields,
        format,
        indexes: HashMap::new(),
        index_names: HashMap::new(),
    })
}

fn is_temporary(flags: &Value) -> bool {
    match flags {
        Value::Map(entries) => map_get_str(entries, "temporary")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        // 1.6 servers store flags as a comma-separated string.
        Value::String(s) => s.as_str().map_or(false, |text| text.contains("temporary")),
        _ => false,
    }
}

fn parse_field(item: &Value) -> Option<Field> {
    let Value::Map(entries) = item else {
        return None;
    };
    Some(Field {
        name: map_get_str(entries, "name").and_then(value_to_string)?,
        field_type: map_get_str(entries, "type")
            .and_then(value_to_string)
            .unwrap_or_else(|| "any".to_string()),
        is_nullable: map_get_str(entries, "is_nullable")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

// _vindex: [space_id, iid, name, type, opts, parts]
fn parse_index(row: &Tuple) -> Option<(u32, SchemaIndex)> {
    let space_id = as_u32(row.get(0)?)?;
    let id = as_u32(row.get(1)?)?;
    let name = value_to_string(row.get(2)?)?;
    let index_type = row.get(3).and_then(value_to_string).unwrap_or_default();
    let unique = match row.get(4) {
        Some(Value::Map(opts)) => map_get_str(opts, "unique")
            .and_then(Value::as_bool)
            .unwrap_or(id == 0),
        _ => id == 0,
    };
    let parts = match row.get(5) {
        Some(Value::Array(items)) => items.iter().filter_map(parse_part).collect(),
        _ => Vec::new(),
    };

    Some((
        space_id,
        SchemaIndex {
            id,
            name,
            index_type,
            unique,
            parts,
        },
    ))
}

// Parts come as `[field_no, type]` or `{field = n, type = t, ...}`.
fn parse_part(item: &Value) -> Option<IndexPart> {
    match item {
        Value::Array(items) => Some(IndexPart {
            field_no: as_u32(items.first()?)?,
            field_type: items.get(1).and_then(value_to_string).unwrap_or_default(),
        }),
        Value::Map(entries) => Some(IndexPart {
            field_no: map_get_str(entries, "field").and_then(as_u32)?,
            field_type: map_get_str(entries, "type")
                .and_then(value_to_string)
                .unwrap_or_default(),
        }),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn field(name: &str, field_type: &str) -> Value {
        Value::Map(vec![
            (Value::from("name"), Value::from(name)),
            (Value::from("type"), Value::from(field_type)),
        ])
    }

    /// `users` (id 512): `[id, name, age]`, primary index on `id`,
    /// secondary `name_age` on `(name, age)`. Schema id 7.
    pub(crate) fn sample_schema() -> Schema {
        let spaces = vec![
            Tuple::new(
                vec![
                    Value::from(512),
                    Value::from(1),
                    Value::from("users"),
                    Value::from("memtx"),
                    Value::from(0),
                    Value::Map(vec![]),
                    Value::Array(vec![
                        field("id", "unsigned"),
                        field("name", "string"),
                        field("age", "unsigned"),
                    ]),
                ],
                None,
            ),
            Tuple::new(
                vec![
                    Value::from(513),
                    Value::from(1),
                    Value::from("blobs"),
                    Value::from("vinyl"),
                    Value::from(0),
                    Value::Map(vec![(Value::from("temporary"), Value::from(true))]),
                    Value::Array(vec![]),
                ],
                None,
            ),
        ];
        let indexes = vec![
            Tuple::new(
                vec![
                    Value::from(512),
                    Value::from(0),
                    Value::from("primary"),
                    Value::from("TREE"),
                    Value::Map(vec![(Value::from("unique"), Value::from(true))]),
                    Value::Array(vec![Value::Array(vec![
                        Value::from(0),
                        Value::from("unsigned"),
                    ])]),
                ],
                None,
            ),
            Tuple::new(
                vec![
                    Value::from(512),
                    Value::from(1),
                    Value::from("name_age"),
                    Value::from("TREE"),
                    Value::Map(vec![(Value::from("unique"), Value::from(false))]),
                    Value::Array(vec![
                        Value::Map(vec![
                            (Value::from("field"), Value::from(1)),
                            (Value::from("type"), Value::from("string")),
                        ]),
                        Value::Map(vec![
                            (Value::from("field"), Value::from(2)),
                            (Value::from("type"), Value::from("unsigned")),
                        ]),
                    ]),
                ],
                None,
            ),
        ];
        Schema::from_rows(Some(7), &spaces, &indexes)
    }

    #[test]
    fn test_from_rows() {
        let schema = sample_schema();

        assert_eq!(schema.id(), Some(7));
        assert_eq!(schema.len(), 2);

        let users = schema.space_by_name("users").unwrap();
        assert_eq!(users.id, 512);
        assert_eq!(users.engine, "memtx");
        assert_eq!(users.fields.len(), 3);
        assert_eq!(users.format().unwrap().names()[2], "age");

        let secondary = users.lookup_index(&IndexRef::from("name_age")).unwrap();
        assert_eq!(secondary.id, 1);
        assert!(!secondary.unique);
        assert_eq!(
            secondary.parts.iter().map(|p| p.field_no).collect::<Vec<_>>(),
            vec![1, 2]
        );

        let blobs = schema.space_by_id(513).unwrap();
        assert!(blobs.temporary);
        assert!(blobs.format().is_none());
    }

    #[test]
    fn test_lookup_space() {
        let schema = sample_schema();

        assert_eq!(schema.space_id(&SpaceRef::from("users")).unwrap(), 512);
        assert_eq!(schema.space_id(&SpaceRef::Id(9000)).unwrap(), 9000);
        assert!(schema.lookup_space(&SpaceRef::Id(9000)).unwrap().is_none());
        assert_eq!(
            schema.space_id(&SpaceRef::from("nope")).unwrap_err(),
            LookupError::SpaceNotFound("nope".to_string())
        );
    }

    #[test]
    fn test_lookup_index() {
        let schema = sample_schema();
        let users = SpaceRef::from("users");

        assert_eq!(schema.lookup_index(&users, &IndexRef::default()).unwrap(), 0);
        assert_eq!(
            schema.lookup_index(&users, &IndexRef::from("name_age")).unwrap(),
            1
        );
        assert!(matches!(
            schema.lookup_index(&users, &IndexRef::from("by_email")),
            Err(LookupError::IndexNotFound { .. })
        ));
        assert!(matches!(
            schema.lookup_index(&SpaceRef::Id(9000), &IndexRef::from("primary")),
            Err(LookupError::IndexNotFound { .. })
        ));
    }

    #[test]
    fn test_resolve_field() {
        let schema = sample_schema();

        assert_eq!(
            schema.resolve_field(&SpaceRef::from("users"), "age").unwrap(),
            2
        );
        assert!(matches!(
            schema.resolve_field(&SpaceRef::from("users"), "email"),
            Err(LookupError::FieldNotFound { .. })
        ));
        assert_eq!(
            schema
                .resolve_field(&SpaceRef::from("blobs"), "id")
                .unwrap_err(),
            LookupError::NoFormat("blobs".to_string())
        );
    }

    #[test]
    fn test_tuple_from_names_fills_gaps() {
        let schema = sample_schema();
        let users = schema.space_by_name("users").unwrap();

        let tuple = users
            .tuple_from_names(&[
                ("age".to_string(), Value::from(30)),
                ("id".to_string(), Value::from(1)),
            ])
            .unwrap();

        assert_eq!(tuple, vec![Value::from(1), Value::Nil, Value::from(30)]);
    }

    #[test]
    fn test_key_from_names_follows_parts() {
        let schema = sample_schema();
        let users = schema.space_by_name("users").unwrap();
        let index = users.lookup_index(&IndexRef::from("name_age")).unwrap();

        let key = users
            .key_from_names(
                index,
                &[
                    ("age".to_string(), Value::from(30)),
                    ("name".to_string(), Value::from("alice")),
                ],
            )
            .unwrap();
        assert_eq!(key, vec![Value::from("alice"), Value::from(30)]);

        let prefix = users
            .key_from_names(index, &[("name".to_string(), Value::from("bob"))])
            .unwrap();
        assert_eq!(prefix, vec![Value::from("bob")]);
    }

    #[test]
    fn test_key_from_names_rejects_non_prefix() {
        let schema = sample_schema();
        let users = schema.space_by_name("users").unwrap();
        let index = users.lookup_index(&IndexRef::from("name_age")).unwrap();

        let err = users
            .key_from_names(index, &[("age".to_string(), Value::from(30))])
            .unwrap_err();
        assert_eq!(
            err,
            LookupError::NotInIndex {
                index: "name_age".to_string(),
                field: "age".to_string(),
            }
        );
    }
}
