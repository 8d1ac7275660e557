//! Unified error handling for the adapter.

use duffel_store::{RecordId, TableName};
use thiserror::Error;

/// All errors the adapter surface can report.
///
/// Clone + PartialEq so a single fatal condition can be handed to every
/// queued caller and asserted on in tests. Backend-specific error payloads
/// are carried as strings for the same reason.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Bad call shape. Signaled synchronously, never dispatched.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A table name not present in the configured schema. Synchronous.
    #[error("table not in schema: {table}")]
    SchemaViolation { table: TableName },

    /// The backend failed to open, initialize, or migrate. Delivered once
    /// via the setup-error hook; the adapter is unusable afterward.
    #[error("database failed to set up: {0}")]
    SetUpFailure(String),

    /// A single call's backend execution failed. Delivered via that call's
    /// result only; subsequent calls are unaffected.
    #[error("storage failure{}: {message}", format_location(.table, .id))]
    StorageFailure {
        table: Option<TableName>,
        id: Option<RecordId>,
        message: String,
    },

    /// Write capacity exhausted. Unrecoverable: the dispatcher goes fatal.
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The database is in an unrecoverable state; queued calls are rejected
    /// without execution.
    #[error("database is in an unrecoverable state: {0}")]
    Fatal(String),
}

fn format_location(table: &Option<TableName>, id: &Option<RecordId>) -> String {
    match (table, id) {
        (Some(table), Some(id)) => format!(" in '{}' at '{}'", table, id),
        (Some(table), None) => format!(" in '{}'", table),
        _ => String::new(),
    }
}

impl AdapterError {
    /// Wrap a backend failure that has no table/id context.
    pub fn storage(message: impl Into<String>) -> Self {
        AdapterError::StorageFailure {
            table: None,
            id: None,
            message: message.into(),
        }
    }

    /// Whether this error poisons the dispatcher.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AdapterError::QuotaExceeded(_) | AdapterError::Fatal(_) | AdapterError::SetUpFailure(_)
        )
    }
}

impl From<duffel_store::Error> for AdapterError {
    fn from(err: duffel_store::Error) -> Self {
        use duffel_store::Error as E;
        match &err {
            E::RecordAlreadyExists { table, id } | E::RecordNotFound { table, id } => {
                AdapterError::StorageFailure {
                    table: Some(table.clone()),
                    id: Some(id.clone()),
                    message: err_kind(&err),
                }
            }
            E::TableNotFound(table) => AdapterError::StorageFailure {
                table: Some(table.clone()),
                id: None,
                message: "table not found".into(),
            },
            other => AdapterError::storage(other.to_string()),
        }
    }
}

fn err_kind(err: &duffel_store::Error) -> String {
    match err {
        duffel_store::Error::RecordAlreadyExists { .. } => "record already exists".into(),
        duffel_store::Error::RecordNotFound { .. } => "record not found".into(),
        other => other.to_string(),
    }
}

impl From<rusqlite::Error> for AdapterError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, _) = &err {
            if code.code == rusqlite::ErrorCode::DiskFull {
                return AdapterError::QuotaExceeded(err.to_string());
            }
        }
        AdapterError::storage(err.to_string())
    }
}

/// Result type alias for adapter operations.
pub type Result<T> = std::result::Result<T, AdapterError>;
