//! The public adapter surface.
//!
//! Every method validates its arguments synchronously, fixes the call's
//! FIFO position by submitting an envelope, and returns a [`CallHandle`]
//! the caller awaits for the result. Two calls submitted in order execute
//! in that order regardless of when their handles are polled.

use crate::{
    call::{CallHandle, CallResult, DbCall, RawStatement},
    clone::ClonePolicy,
    config::{AdapterConfig, BackendKind},
    dispatcher::{BackendFactory, Dispatcher, DispatcherOptions},
    error::{AdapterError, Result},
    memory::MemoryBackend,
    sqlite::SqliteBackend,
    StorageBackend,
};
use duffel_store::{
    BatchOperation, RawRecord, RecordId, Schema, SerializedQuery, TableName,
};
use serde_json::Value;
use std::sync::Arc;

/// A local record database behind an asynchronous dispatch layer.
///
/// Cheap to clone; all clones feed the same execution context.
#[derive(Clone)]
pub struct Adapter {
    name: Arc<str>,
    schema: Arc<Schema>,
    dispatcher: Dispatcher,
}

impl Adapter {
    /// Create an adapter and start its execution context. Backend setup is
    /// enqueued as the context's first unit of work; if it fails, the
    /// configured setup-error hook fires and every call is rejected.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: AdapterConfig) -> Self {
        let AdapterConfig {
            name,
            schema,
            migrations,
            backend,
            use_isolated_execution_context,
            on_setup_error,
            on_quota_exceeded_error,
            tuning,
            persistence,
        } = config;

        tracing::debug!(name = %name, version = schema.version, "starting adapter");

        let factory: BackendFactory = match backend {
            BackendKind::Sqlite { path } => {
                let schema = schema.clone();
                Box::new(move || {
                    let backend = SqliteBackend::open(path, schema, migrations)?;
                    Ok(Box::new(backend) as Box<dyn StorageBackend>)
                })
            }
            BackendKind::Memory { snapshot_path } => {
                let schema = schema.clone();
                Box::new(move || {
                    let backend =
                        MemoryBackend::new(schema, migrations, snapshot_path, persistence);
                    Ok(Box::new(backend) as Box<dyn StorageBackend>)
                })
            }
        };

        let dispatcher = Dispatcher::start(
            factory,
            DispatcherOptions {
                isolated: use_isolated_execution_context,
                autosave: tuning.autosave,
                autosave_interval: tuning.autosave_interval,
                on_setup_error,
                on_quota_exceeded_error,
            },
        );

        Self {
            name: name.into(),
            schema: Arc::new(schema),
            dispatcher,
        }
    }

    /// The configured database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The active schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn check_table(&self, table: &str) -> Result<()> {
        if self.schema.has_table(table) {
            Ok(())
        } else {
            Err(AdapterError::SchemaViolation {
                table: table.to_string(),
            })
        }
    }

    fn submit<T>(
        &self,
        call: DbCall,
        arg_policy: ClonePolicy,
        result_policy: ClonePolicy,
        convert: fn(CallResult) -> Result<T>,
    ) -> Result<CallHandle<T>> {
        let rx = self.dispatcher.submit(call, arg_policy, result_policy)?;
        Ok(CallHandle::new(rx, convert))
    }

    /// Find one record by id. Soft-deleted records are not found.
    pub fn find(
        &self,
        table: impl Into<TableName>,
        id: impl Into<RecordId>,
    ) -> Result<CallHandle<Option<RawRecord>>> {
        let table = table.into();
        let id = id.into();
        self.check_table(&table)?;
        if id.is_empty() {
            return Err(AdapterError::InvalidArgument("empty record id".into()));
        }
        self.submit(
            DbCall::Find { table, id },
            ClonePolicy::Immutable,
            ClonePolicy::ShallowCloneDeepObjects,
            CallResult::into_record,
        )
    }

    /// Run a query, excluding soft-deleted records.
    pub fn query(&self, query: SerializedQuery) -> Result<CallHandle<Vec<RawRecord>>> {
        self.check_table(query.table())?;
        self.submit(
            DbCall::Query {
                query: Arc::new(query),
            },
            ClonePolicy::Immutable,
            ClonePolicy::ShallowCloneDeepObjects,
            CallResult::into_records,
        )
    }

    /// Run a query and return only matching record ids.
    pub fn query_ids(&self, query: SerializedQuery) -> Result<CallHandle<Vec<RecordId>>> {
        self.check_table(query.table())?;
        self.submit(
            DbCall::QueryIds {
                query: Arc::new(query),
            },
            ClonePolicy::Immutable,
            ClonePolicy::Immutable,
            CallResult::into_ids,
        )
    }

    /// Run a query without the soft-delete filter, returning raw rows.
    pub fn unsafe_query_raw(&self, query: SerializedQuery) -> Result<CallHandle<Vec<Value>>> {
        self.check_table(query.table())?;
        self.submit(
            DbCall::UnsafeQueryRaw {
                query: Arc::new(query),
            },
            ClonePolicy::Immutable,
            ClonePolicy::Immutable,
            CallResult::into_rows,
        )
    }

    /// Count records matching a query, excluding soft-deleted ones.
    pub fn count(&self, query: SerializedQuery) -> Result<CallHandle<usize>> {
        self.check_table(query.table())?;
        self.submit(
            DbCall::Count {
                query: Arc::new(query),
            },
            ClonePolicy::Immutable,
            ClonePolicy::Immutable,
            CallResult::into_count,
        )
    }

    /// Apply a sequence of operations atomically: either every operation is
    /// applied or none are. The operations are detached from the caller's
    /// copies before dispatch.
    pub fn batch(&self, operations: &[BatchOperation]) -> Result<CallHandle<()>> {
        for op in operations {
            self.check_table(op.table())?;
            if op.id().is_empty() {
                return Err(AdapterError::InvalidArgument("empty record id".into()));
            }
        }
        let operations = ClonePolicy::ShallowCloneDeepObjects.apply_operations(operations);
        self.submit(
            DbCall::Batch { operations },
            ClonePolicy::ShallowCloneDeepObjects,
            ClonePolicy::Immutable,
            CallResult::into_done,
        )
    }

    /// Ids of soft-deleted records in a table.
    pub fn get_deleted_records(
        &self,
        table: impl Into<TableName>,
    ) -> Result<CallHandle<Vec<RecordId>>> {
        let table = table.into();
        self.check_table(&table)?;
        self.submit(
            DbCall::GetDeletedRecords { table },
            ClonePolicy::Immutable,
            ClonePolicy::Immutable,
            CallResult::into_ids,
        )
    }

    /// Permanently remove previously soft-deleted records. Sugar for a
    /// batch of destroy operations; ids not present are skipped.
    pub fn destroy_deleted_records(
        &self,
        table: impl Into<TableName>,
        ids: &[RecordId],
    ) -> Result<CallHandle<()>> {
        let table = table.into();
        self.check_table(&table)?;
        let operations: Vec<BatchOperation> = ids
            .iter()
            .map(|id| BatchOperation::destroy_permanently(table.clone(), id.clone()))
            .collect();
        self.submit(
            DbCall::Batch { operations },
            ClonePolicy::Immutable,
            ClonePolicy::Immutable,
            CallResult::into_done,
        )
    }

    /// Run raw statements inside one transaction. Relational backends only.
    pub fn unsafe_execute(&self, statements: Vec<RawStatement>) -> Result<CallHandle<()>> {
        self.submit(
            DbCall::UnsafeExecute { statements },
            ClonePolicy::Immutable,
            ClonePolicy::Immutable,
            CallResult::into_done,
        )
    }

    /// Get a local storage entry. Absence resolves to `None`, not an error.
    pub fn get_local(&self, key: impl Into<String>) -> Result<CallHandle<Option<String>>> {
        self.submit(
            DbCall::GetLocal { key: key.into() },
            ClonePolicy::Immutable,
            ClonePolicy::Immutable,
            CallResult::into_local,
        )
    }

    /// Create or overwrite a local storage entry. Only string values are
    /// accepted; anything else is rejected synchronously.
    pub fn set_local(&self, key: impl Into<String>, value: &Value) -> Result<CallHandle<()>> {
        let value = value
            .as_str()
            .ok_or_else(|| {
                AdapterError::InvalidArgument("local storage values must be strings".into())
            })?
            .to_string();
        self.submit(
            DbCall::SetLocal {
                key: key.into(),
                value,
            },
            ClonePolicy::Immutable,
            ClonePolicy::Immutable,
            CallResult::into_done,
        )
    }

    /// Remove a local storage entry. Removing a missing key succeeds.
    pub fn remove_local(&self, key: impl Into<String>) -> Result<CallHandle<()>> {
        self.submit(
            DbCall::RemoveLocal { key: key.into() },
            ClonePolicy::Immutable,
            ClonePolicy::Immutable,
            CallResult::into_done,
        )
    }

    /// Destroy all records, local entries, and the version marker. Until
    /// the next setup the database reads as empty at version 0.
    pub fn unsafe_reset_database(&self) -> Result<CallHandle<()>> {
        self.submit(
            DbCall::UnsafeResetDatabase,
            ClonePolicy::Immutable,
            ClonePolicy::Immutable,
            CallResult::into_done,
        )
    }

    /// Flush and shut down the execution context. Calls submitted before
    /// the close still run; calls submitted after are rejected.
    pub fn close(&self) -> Result<CallHandle<()>> {
        let rx = self.dispatcher.close()?;
        Ok(CallHandle::new(rx, CallResult::into_done))
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("name", &self.name)
            .field("schema_version", &self.schema.version)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duffel_store::{ColumnDef, ColumnType, TableSchema};
    use serde_json::json;

    fn test_schema() -> Schema {
        Schema::new(1).with_table(TableSchema::new(
            "posts",
            vec![ColumnDef::required("title", ColumnType::String)],
        ))
    }

    fn memory_adapter() -> Adapter {
        Adapter::new(AdapterConfig::new(
            "test",
            test_schema(),
            BackendKind::Memory {
                snapshot_path: None,
            },
        ))
    }

    #[tokio::test]
    async fn unknown_table_rejected_synchronously() {
        let adapter = memory_adapter();

        let err = adapter.find("ghosts", "g1").unwrap_err();
        assert_eq!(
            err,
            AdapterError::SchemaViolation {
                table: "ghosts".into()
            }
        );

        assert!(adapter.query(SerializedQuery::new("ghosts")).is_err());
        assert!(adapter
            .batch(&[BatchOperation::create(
                "ghosts",
                "g1",
                RawRecord::empty()
            )])
            .is_err());
        assert!(adapter.get_deleted_records("ghosts").is_err());
    }

    #[tokio::test]
    async fn empty_id_rejected_synchronously() {
        let adapter = memory_adapter();
        assert!(matches!(
            adapter.find("posts", ""),
            Err(AdapterError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn non_string_local_value_rejected_synchronously() {
        let adapter = memory_adapter();
        assert!(matches!(
            adapter.set_local("k", &json!(42)),
            Err(AdapterError::InvalidArgument(_))
        ));
        assert!(matches!(
            adapter.set_local("k", &json!({"nested": true})),
            Err(AdapterError::InvalidArgument(_))
        ));

        adapter.set_local("k", &json!("fine")).unwrap().await.unwrap();
        let value = adapter.get_local("k").unwrap().await.unwrap();
        assert_eq!(value, Some("fine".into()));
    }
}
