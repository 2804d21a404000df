use std::sync::{Arc, PoisonError, RwLock};

use super::{IndexRef, Schema, SchemaSpace, SpaceRef};
use crate::error::LookupError;

/// Swap cell holding the current [`Schema`] snapshot.
///
/// Readers take a cheap `Arc` snapshot and never observe a partially
/// replaced schema.
#[derive(Debug, Default)]
pub struct SchemaCache {
    current: RwLock<Arc<Schema>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<Schema> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publish a new snapshot, returning the previous one.
    pub fn replace(&self, schema: Arc<Schema>) -> Arc<Schema> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, schema)
    }

    /// Schema id of the current snapshot.
    pub fn schema_id(&self) -> Option<u64> {
        self.snapshot().id()
    }

    pub fn lookup_space(&self, space: &SpaceRef) -> Result<Option<Arc<SchemaSpace>>, LookupError> {
        Ok(self.snapshot().lookup_space(space)?.cloned())
    }

    pub fn lookup_index(&self, space: &SpaceRef, index: &IndexRef) -> Result<u32, LookupError> {
        self.snapshot().lookup_index(space, index)
    }

    pub fn resolve_field(&self, space: &SpaceRef, field: &str) -> Result<usize, LookupError> {
        self.snapshot().resolve_field(space, field)
    }
}
