//! # Duffel Store
//!
//! The document model for Duffel, a local offline-capable record store.
//!
//! This crate provides the pure data layer: schemas, raw records, serialized
//! queries, batch operations, migrations, and an in-memory document store.
//! It is one of the two interchangeable storage engines behind the Duffel
//! adapter (the other is SQLite, in `duffel-adapter`).
//!
//! ## Design Principles
//!
//! - **No IO**: the store has no knowledge of files, threads, or platform
//! - **Deterministic**: snapshots of equal states serialize identically
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Raw Records
//!
//! Data is stored as [`RawRecord`]s: JSON objects with two reserved fields,
//! `id` and `_status` (`created` | `updated` | `deleted`). The `deleted`
//! status is an application-level soft-delete convention; records only leave
//! storage through a destroy-permanently operation. Records share their
//! backing object via `Arc` and mutate copy-on-write, so handing one across
//! a thread boundary never exposes later mutation.
//!
//! ### Serialized Queries
//!
//! A [`SerializedQuery`] is an immutable predicate/sort/limit tree over one
//! table. Because it is never mutated after construction it can be shared
//! by reference across execution contexts.
//!
//! ### Batch Operations
//!
//! Writes are sequences of [`BatchOperation`]s (create, update,
//! destroy-permanently) applied atomically: on any failure the store is left
//! untouched. Later operations in a batch observe earlier operations'
//! effects.
//!
//! ## Quick Start
//!
//! ```rust
//! use duffel_store::{
//!     BatchOperation, ColumnDef, ColumnType, DocumentStore, RawRecord, Schema, SerializedQuery,
//!     TableSchema,
//! };
//! use serde_json::json;
//!
//! // 1. Define a schema
//! let schema = Schema::new(1).with_table(TableSchema::new(
//!     "posts",
//!     vec![
//!         ColumnDef::required("title", ColumnType::String),
//!         ColumnDef::optional("likes", ColumnType::Int),
//!     ],
//! ));
//!
//! // 2. Create a store
//! let mut store = DocumentStore::new(schema);
//!
//! // 3. Apply a batch
//! let record = RawRecord::from_value(json!({"title": "Hello", "likes": 3})).unwrap();
//! store
//!     .batch(&[BatchOperation::create("posts", "post_1", record)])
//!     .unwrap();
//!
//! // 4. Query records
//! let results = store.query(&SerializedQuery::new("posts")).unwrap();
//! assert_eq!(results.len(), 1);
//! ```
//!
//! ## Persistence
//!
//! Use [`StoreSnapshot::capture`] and [`StoreSnapshot::restore_into`] for
//! persistence. Snapshots serialize to JSON with deterministic ordering.

pub mod error;
pub mod migration;
pub mod operation;
pub mod query;
pub mod record;
pub mod schema;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use error::Error;
pub use migration::{migration_chain, Migration, MigrationStep};
pub use operation::BatchOperation;
pub use query::{Clause, Comparison, SerializedQuery, SortBy, SortDirection};
pub use record::{RawRecord, RecordStatus, ID_FIELD, STATUS_FIELD};
pub use schema::{ColumnDef, ColumnType, Schema, TableSchema};
pub use snapshot::{StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{DocumentStore, Table};

/// Type aliases for clarity
pub type TableName = String;
pub type RecordId = String;
pub type SchemaVersion = u32;
