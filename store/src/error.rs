//! Error types for the Duffel document store.

use crate::{RecordId, SchemaVersion, TableName};
use thiserror::Error;

/// All possible errors from the document store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("table not found: {0}")]
    TableNotFound(TableName),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("missing required column: {0}")]
    MissingRequiredColumn(String),

    #[error("type mismatch for column '{column}': expected {expected}, got {got}")]
    TypeMismatch {
        column: String,
        expected: String,
        got: String,
    },

    // Batch operation errors
    #[error("record already exists in '{table}': {id}")]
    RecordAlreadyExists { table: TableName, id: RecordId },

    #[error("record not found in '{table}': {id}")]
    RecordNotFound { table: TableName, id: RecordId },

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch {
        expected: SchemaVersion,
        actual: SchemaVersion,
    },

    #[error("migration chain does not cover versions {from} to {to}")]
    MigrationGap {
        from: SchemaVersion,
        to: SchemaVersion,
    },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;
