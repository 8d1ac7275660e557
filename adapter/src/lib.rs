//! Asynchronous dispatch layer over local record storage.
//!
//! An [`Adapter`] fronts one database behind an isolated execution context:
//! a dedicated task that owns the storage backend and drains a FIFO queue of
//! call envelopes. Callers submit operations synchronously (fixing their
//! order) and await [`CallHandle`] futures for the results. Two backends are
//! provided: SQLite ([`sqlite::SqliteBackend`]) and an in-memory document
//! store with optional snapshot persistence ([`memory::MemoryBackend`]).
//!
//! ```no_run
//! use duffel_adapter::{Adapter, AdapterConfig, BackendKind};
//! use duffel_store::{ColumnDef, ColumnType, Schema, SerializedQuery, TableSchema};
//!
//! # async fn demo() -> Result<(), duffel_adapter::AdapterError> {
//! let schema = Schema::new(1).with_table(TableSchema::new(
//!     "posts",
//!     vec![ColumnDef::required("title", ColumnType::String)],
//! ));
//! let adapter = Adapter::new(AdapterConfig::new(
//!     "app",
//!     schema,
//!     BackendKind::Memory { snapshot_path: None },
//! ));
//!
//! let posts = adapter.query(SerializedQuery::new("posts"))?.await?;
//! assert!(posts.is_empty());
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod backend;
pub mod call;
pub mod clone;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod sqlite;

pub use adapter::Adapter;
pub use backend::StorageBackend;
pub use call::{CallHandle, CallResult, DbCall, RawStatement};
pub use clone::ClonePolicy;
pub use config::{
    AdapterConfig, BackendKind, BackendTuning, ChunkCodec, PersistenceTuning,
};
pub use dispatcher::{BackendFactory, Dispatcher, DispatcherOptions};
pub use error::{AdapterError, Result};
