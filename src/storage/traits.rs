//! Storage traits and error types
//!
//! This module defines the trait interface for entity stores and
//! associated error types.

use std::hash::Hash;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Identifies an entity within a store
///
/// `exists`, `update` and `delete` match entities by this key, the way a
/// relational store matches rows by primary key.
pub trait EntityKey {
    type Key: Eq + Hash + Clone + Send + Sync;

    fn key(&self) -> Self::Key;
}

/// Trait for sequential, offset-addressed entity stores
///
/// The crawl controller only ever calls [`EntityStore::find`], sequentially
/// and starting from offset 0, on tokio's blocking pool, so a synchronous
/// database driver can sit behind it. An `Ok(None)` is read again after the
/// next completion while units are still out. The other
/// operations are there for strategies, which may call them concurrently
/// from fetcher tasks, so implementations must be safe to share between
/// threads.
pub trait EntityStore<E>: Send + Sync {
    /// Inserts a new entity
    ///
    /// # Returns
    ///
    /// `true` if the entity was inserted, `false` if it already existed
    fn insert(&self, entity: E) -> StoreResult<bool>;

    /// Deletes the entity matching `entity`'s key
    fn delete(&self, entity: &E) -> StoreResult<bool>;

    /// Finds the entity at a specific offset
    ///
    /// # Returns
    ///
    /// * `Ok(Some(entity))` - An entity exists at this offset
    /// * `Ok(None)` - The offset is past the end of the sequence
    fn find(&self, offset: u64) -> StoreResult<Option<E>>;

    /// Checks whether an entity with the same key exists
    fn exists(&self, entity: &E) -> StoreResult<bool>;

    /// Replaces the stored entity that has the same key
    fn update(&self, entity: E) -> StoreResult<bool>;
}

impl<E, S> EntityStore<E> for std::sync::Arc<S>
where
    S: EntityStore<E> + ?Sized,
{
    fn insert(&self, entity: E) -> StoreResult<bool> {
        (**self).insert(entity)
    }

    fn delete(&self, entity: &E) -> StoreResult<bool> {
        (**self).delete(entity)
    }

    fn find(&self, offset: u64) -> StoreResult<Option<E>> {
        (**self).find(offset)
    }

    fn exists(&self, entity: &E) -> StoreResult<bool> {
        (**self).exists(entity)
    }

    fn update(&self, entity: E) -> StoreResult<bool> {
        (**self).update(entity)
    }
}
