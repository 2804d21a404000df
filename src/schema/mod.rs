//! Schema cache: space, index and field names mapped to wire identifiers.
//!
//! A [`Schema`] is an immutable snapshot built from the `_vspace` and
//! `_vindex` system spaces and versioned by the server schema id.
//! [`SchemaCache`] holds the current snapshot and swaps it wholesale on
//! refetch.

mod cache;
pub(crate) mod snapshot;

use std::fmt;

pub use cache::SchemaCache;
pub use snapshot::{Field, IndexPart, Schema, SchemaIndex, SchemaSpace};

/// A space addressed by numeric id or by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SpaceRef {
    Id(u32),
    Name(String),
}

/// An index addressed by numeric id or by name. Defaults to the primary index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexRef {
    Id(u32),
    Name(String),
}

impl Default for IndexRef {
    fn default() -> Self {
        IndexRef::Id(0)
    }
}

impl From<u32> for SpaceRef {
    fn from(id: u32) -> Self {
        SpaceRef::Id(id)
    }
}

impl From<&str> for SpaceRef {
    fn from(name: &str) -> Self {
        SpaceRef::Name(name.to_string())
    }
}

impl From<String> for SpaceRef {
    fn from(name: String) -> Self {
        SpaceRef::Name(name)
    }
}

impl From<u32> for IndexRef {
    fn from(id: u32) -> Self {
        IndexRef::Id(id)
    }
}

impl From<&str> for IndexRef {
    fn from(name: &str) -> Self {
        IndexRef::Name(name.to_string())
    }
}

impl From<String> for IndexRef {
    fn from(name: String) -> Self {
        IndexRef::Name(name)
    }
}

impl fmt::Display for SpaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceRef::Id(id) => write!(f, "{id}"),
            SpaceRef::Name(name) => f.write_str(name),
        }
    }
}

impl fmt::Display for IndexRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexRef::Id(id) => write!(f, "{id}"),
            IndexRef::Name(name) => f.write_str(name),
        }
    }
}
