//! The storage backend trait.
//!
//! Two interchangeable engines implement this surface: SQLite
//! ([`crate::sqlite::SqliteBackend`]) and the in-memory document store
//! ([`crate::memory::MemoryBackend`]). The dispatcher owns exactly one boxed
//! backend inside its execution context; `&mut self` everywhere reflects
//! that single-owner model — backends need no interior locking.

use crate::{call::RawStatement, error::Result};
use duffel_store::{BatchOperation, RawRecord, RecordId, SchemaVersion, SerializedQuery, TableName};
use serde_json::Value;

/// The operation surface the dispatcher executes against.
pub trait StorageBackend: Send {
    /// Open/initialize the backend, running any pending schema migrations.
    /// Called exactly once, before any other method.
    fn set_up(&mut self) -> Result<()>;

    /// Find one record by id. Soft-deleted records are not found.
    fn find(&mut self, table: &TableName, id: &RecordId) -> Result<Option<RawRecord>>;

    /// Run a query, excluding soft-deleted records.
    fn query(&mut self, query: &SerializedQuery) -> Result<Vec<RawRecord>>;

    /// Run a query and return only matching ids.
    fn query_ids(&mut self, query: &SerializedQuery) -> Result<Vec<RecordId>>;

    /// Run a query without the soft-delete filter, returning raw rows.
    fn unsafe_query_raw(&mut self, query: &SerializedQuery) -> Result<Vec<Value>>;

    /// Count records matching a query.
    fn count(&mut self, query: &SerializedQuery) -> Result<usize>;

    /// Apply a sequence of operations atomically.
    fn batch(&mut self, operations: &[BatchOperation]) -> Result<()>;

    /// Ids of soft-deleted records in a table.
    fn get_deleted_records(&mut self, table: &TableName) -> Result<Vec<RecordId>>;

    /// Run raw statements inside one transaction. Relational backends only.
    fn unsafe_execute(&mut self, statements: &[RawStatement]) -> Result<()>;

    /// Get a local storage entry. Absence is a valid, non-error state.
    fn get_local(&mut self, key: &str) -> Result<Option<String>>;

    /// Create or overwrite a local storage entry.
    fn set_local(&mut self, key: &str, value: &str) -> Result<()>;

    /// Remove a local storage entry.
    fn remove_local(&mut self, key: &str) -> Result<()>;

    /// Drop all tables and local entries and reset the version marker to 0.
    fn unsafe_reset(&mut self) -> Result<()>;

    /// The stored schema version marker.
    fn user_version(&mut self) -> Result<SchemaVersion>;

    /// Periodic persistence opportunity; a no-op for durable backends.
    fn autosave_tick(&mut self) -> Result<()> {
        Ok(())
    }

    /// Flush and release the backend. No methods are called afterwards.
    fn close(&mut self) -> Result<()>;
}
