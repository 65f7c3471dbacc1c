//! Storage module for entity persistence
//!
//! The crawl engine never persists anything itself. It reads entities from
//! an [`EntityStore`] by offset, and strategies write back through the same
//! store. This module defines that contract and provides an in-memory
//! implementation used by the runner binary and the tests.

mod memory;
mod traits;

pub use memory::MemoryStore;
pub use traits::{EntityKey, EntityStore, StoreError, StoreResult};
