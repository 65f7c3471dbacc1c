//! In-memory entity store
//!
//! Entities are kept in insertion order, so offsets are stable as long as
//! nothing is deleted. Deleting shifts every later entity down by one, the
//! same way `LIMIT 1 OFFSET n` behaves on a relational table.

use crate::storage::traits::{EntityKey, EntityStore, StoreError, StoreResult};
use std::collections::HashSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

struct Entries<E: EntityKey> {
    ordered: Vec<E>,
    keys: HashSet<E::Key>,
}

/// Thread-safe in-memory implementation of [`EntityStore`]
pub struct MemoryStore<E: EntityKey> {
    entries: RwLock<Entries<E>>,
}

impl<E: EntityKey> MemoryStore<E> {
    /// Creates an empty store
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Entries {
                ordered: Vec::new(),
                keys: HashSet::new(),
            }),
        }
    }

    /// Creates a store seeded with `entities`, skipping duplicate keys
    pub fn with_entities(entities: impl IntoIterator<Item = E>) -> Self {
        let store = Self::new();
        if let Ok(mut entries) = store.entries.write() {
            for entity in entities {
                if entries.keys.insert(entity.key()) {
                    entries.ordered.push(entity);
                }
            }
        }
        store
    }

    /// Returns the number of stored entities
    pub fn len(&self) -> usize {
        self.read().map(|entries| entries.ordered.len()).unwrap_or(0)
    }

    /// Returns whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Entries<E>>> {
        self.entries.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Entries<E>>> {
        self.entries.write().map_err(|_| StoreError::Poisoned)
    }
}

impl<E: EntityKey> Default for MemoryStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EntityStore<E> for MemoryStore<E>
where
    E: EntityKey + Clone + Send + Sync,
{
    fn insert(&self, entity: E) -> StoreResult<bool> {
        let mut entries = self.write()?;
        if !entries.keys.insert(entity.key()) {
            return Ok(false);
        }
        entries.ordered.push(entity);
        Ok(true)
    }

    fn delete(&self, entity: &E) -> StoreResult<bool> {
        let key = entity.key();
        let mut entries = self.write()?;
        if !entries.keys.remove(&key) {
            return Ok(false);
        }
        entries.ordered.retain(|stored| stored.key() != key);
        Ok(true)
    }

    fn find(&self, offset: u64) -> StoreResult<Option<E>> {
        let entries = self.read()?;
        let Ok(index) = usize::try_from(offset) else {
            return Ok(None);
        };
        Ok(entries.ordered.get(index).cloned())
    }

    fn exists(&self, entity: &E) -> StoreResult<bool> {
        Ok(self.read()?.keys.contains(&entity.key()))
    }

    fn update(&self, entity: E) -> StoreResult<bool> {
        let key = entity.key();
        let mut entries = self.write()?;
        match entries.ordered.iter_mut().find(|stored| stored.key() == key) {
            Some(slot) => {
                *slot = entity;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
