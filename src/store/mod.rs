//! Redo stores
//!
//! The transaction manager keeps no non-volatile state of its own. Every pending
//! operation is recorded in a [`RedoStore`] supplied by the application.
//!
//! A store for a transactional resource manager must write redo records in the
//! same database transaction as the manager's own changes. For idempotent
//! resource managers the record must be durable before the side effect starts.
//! Either way a crash leaves the record and the work consistent.
//!
//! Two stores are provided:
//! - [`MemoryRedoStore`]: volatile, for tests and for embedding in a host that
//!   persists records another way
//! - [`FileRedoStore`]: an append-only redo file with checksummed frames

mod file;
mod memory;

pub use file::{FileRedoStore, FileStoreConfig};
pub use memory::MemoryRedoStore;

use crate::error::Result;
use crate::etx::Redo;

/// Storage for redo records, implemented by the parent application
pub trait RedoStore: Send + Sync {
    /// All redo records in id order
    fn all(&self) -> Result<Vec<Redo>>;

    /// Delete a record. Deleting a record that doesn't exist is not an error.
    fn delete_id(&self, id: i64) -> Result<()>;

    /// Records for a resource manager whose transaction started before
    /// `before` (nanoseconds since the epoch), in id order
    fn for_manager(&self, manager: &str, before: i64) -> Result<Vec<Redo>>;

    /// Get a record if it still exists
    fn get_if(&self, id: i64) -> Result<Option<Redo>>;

    /// Add a record
    fn insert(&self, redo: &Redo) -> Result<()>;

    /// Replace an existing record
    fn update(&self, redo: &Redo) -> Result<()>;
}
