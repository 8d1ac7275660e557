//! The in-memory document store.
//!
//! Holds all records grouped by table, plus a distinguished local-storage
//! key/value map used for adapter bookkeeping. Pure logic, no IO: the
//! adapter layer decides when and how the state is persisted.

use crate::{
    error::Result, BatchOperation, Error, Migration, MigrationStep, RawRecord, RecordId, Schema,
    SchemaVersion, SerializedQuery, TableName,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A table of records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    records: HashMap<RecordId, RawRecord>,
}

impl Table {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    /// Get a record by id, including soft-deleted ones.
    pub fn get(&self, id: &str) -> Option<&RawRecord> {
        self.records.get(id)
    }

    /// Insert a record under the given id.
    pub fn insert(&mut self, id: RecordId, record: RawRecord) {
        self.records.insert(id, record);
    }

    /// Remove a record. Returns it if present.
    pub fn remove(&mut self, id: &str) -> Option<RawRecord> {
        self.records.remove(id)
    }

    /// Check if a record exists (including soft-deleted).
    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// All records that are not soft-deleted.
    pub fn active_records(&self) -> impl Iterator<Item = &RawRecord> {
        self.records.values().filter(|r| !r.is_deleted())
    }

    /// All records including soft-deleted.
    pub fn all_records(&self) -> impl Iterator<Item = &RawRecord> {
        self.records.values()
    }

    /// Count of all records including soft-deleted.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table holds no records at all.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// The main document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStore {
    /// Schema for table lookup and payload validation
    schema: Schema,
    /// Schema version marker of the stored data
    user_version: SchemaVersion,
    /// Tables by name
    tables: HashMap<TableName, Table>,
    /// Local key/value entries, stored outside any table
    local: HashMap<String, String>,
}

impl DocumentStore {
    /// Create a new store with empty tables for every schema table.
    pub fn new(schema: Schema) -> Self {
        let mut tables = HashMap::new();
        for name in schema.tables.keys() {
            tables.insert(name.clone(), Table::new());
        }
        let user_version = schema.version;

        Self {
            schema,
            user_version,
            tables,
            local: HashMap::new(),
        }
    }

    /// Get the schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The schema version marker of the stored data.
    pub fn user_version(&self) -> SchemaVersion {
        self.user_version
    }

    /// Set the schema version marker.
    pub fn set_user_version(&mut self, version: SchemaVersion) {
        self.user_version = version;
    }

    /// Get a table by name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    fn table_required(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    /// Find a record by table and id. Soft-deleted records are not found.
    pub fn find(&self, table: &str, id: &str) -> Result<Option<&RawRecord>> {
        let record = self
            .table_required(table)?
            .get(id)
            .filter(|r| !r.is_deleted());
        Ok(record)
    }

    /// Run a query, excluding soft-deleted records. Results are sorted and
    /// capped per the query.
    pub fn query(&self, query: &SerializedQuery) -> Result<Vec<&RawRecord>> {
        let table = self.table_required(query.table())?;

        let mut results: Vec<&RawRecord> = table
            .active_records()
            .filter(|r| query.matches(r))
            .collect();

        if !query.sort().is_empty() {
            results.sort_by(|a, b| query.compare_records(a, b));
        } else {
            // Stable output for callers that diff result sets
            results.sort_by(|a, b| a.id().cmp(&b.id()));
        }

        if let Some(limit) = query.limit_value() {
            results.truncate(limit);
        }

        Ok(results)
    }

    /// Run a query and return matching record ids.
    pub fn query_ids(&self, query: &SerializedQuery) -> Result<Vec<RecordId>> {
        let records = self.query(query)?;
        Ok(records
            .iter()
            .filter_map(|r| r.id().map(str::to_string))
            .collect())
    }

    /// Run a query without the soft-delete filter, returning raw JSON rows.
    pub fn query_raw(&self, query: &SerializedQuery) -> Result<Vec<serde_json::Value>> {
        let table = self.table_required(query.table())?;

        let mut results: Vec<&RawRecord> =
            table.all_records().filter(|r| query.matches(r)).collect();
        results.sort_by(|a, b| {
            if query.sort().is_empty() {
                a.id().cmp(&b.id())
            } else {
                query.compare_records(a, b)
            }
        });
        if let Some(limit) = query.limit_value() {
            results.truncate(limit);
        }

        Ok(results.iter().map(|r| r.to_value()).collect())
    }

    /// Count records matching a query, excluding soft-deleted ones.
    pub fn count(&self, query: &SerializedQuery) -> Result<usize> {
        Ok(self.query(query)?.len())
    }

    /// Ids of soft-deleted records in a table.
    pub fn deleted_record_ids(&self, table: &str) -> Result<Vec<RecordId>> {
        let table = self.table_required(table)?;
        let mut ids: Vec<RecordId> = table
            .all_records()
            .filter(|r| r.is_deleted())
            .filter_map(|r| r.id().map(str::to_string))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Apply a sequence of batch operations atomically.
    ///
    /// Operations are staged against copies of the affected tables and only
    /// swapped in once every operation has succeeded; on any failure the
    /// store is left exactly as it was. Later operations in the batch observe
    /// earlier operations' effects.
    pub fn batch(&mut self, operations: &[BatchOperation]) -> Result<()> {
        let mut staged: HashMap<TableName, Table> = HashMap::new();

        for op in operations {
            let table_name = op.table();
            if !staged.contains_key(table_name) {
                let table = self.table_required(table_name)?.clone();
                staged.insert(table_name.clone(), table);
            }
            // Presence guaranteed by the insert above
            let table = staged
                .get_mut(table_name)
                .ok_or_else(|| Error::TableNotFound(table_name.clone()))?;

            match op {
                BatchOperation::Create { table: t, id, record } => {
                    if table.contains(id) {
                        return Err(Error::RecordAlreadyExists {
                            table: t.clone(),
                            id: id.clone(),
                        });
                    }
                    let stored = self.prepare_record(t, id, record, crate::RecordStatus::Created)?;
                    table.insert(id.clone(), stored);
                }
                BatchOperation::Update { table: t, id, record } => {
                    if !table.contains(id) {
                        return Err(Error::RecordNotFound {
                            table: t.clone(),
                            id: id.clone(),
                        });
                    }
                    let stored = self.prepare_record(t, id, record, crate::RecordStatus::Updated)?;
                    table.insert(id.clone(), stored);
                }
                BatchOperation::DestroyPermanently { id, .. } => {
                    // Missing id is a no-op, like a relational DELETE
                    table.remove(id);
                }
            }
        }

        for (name, table) in staged {
            self.tables.insert(name, table);
        }
        Ok(())
    }

    /// Validate a payload and stamp the reserved fields onto it.
    fn prepare_record(
        &self,
        table: &str,
        id: &str,
        record: &RawRecord,
        default_status: crate::RecordStatus,
    ) -> Result<RawRecord> {
        self.schema.validate_payload(table, record.fields())?;

        let mut stored = record.clone();
        stored.set_id(id);
        if stored.get(crate::record::STATUS_FIELD).is_none() {
            stored.set_status(default_status);
        }
        Ok(stored)
    }

    /// Get a local storage entry. Absence is not an error.
    pub fn get_local(&self, key: &str) -> Option<&str> {
        self.local.get(key).map(String::as_str)
    }

    /// Create or overwrite a local storage entry.
    pub fn set_local(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.local.insert(key.into(), value.into());
    }

    /// Remove a local storage entry. Removing a missing key is a no-op.
    pub fn remove_local(&mut self, key: &str) {
        self.local.remove(key);
    }

    /// All local entries.
    pub fn local_entries(&self) -> &HashMap<String, String> {
        &self.local
    }

    /// Drop all records and local entries and reset the version marker to 0.
    /// Schema tables are recreated empty so queries keep working.
    pub fn destroy_everything(&mut self) {
        self.tables.clear();
        for name in self.schema.tables.keys() {
            self.tables.insert(name.clone(), Table::new());
        }
        self.local.clear();
        self.user_version = 0;
    }

    /// Apply a single migration step to the stored data.
    pub fn apply_migration_step(&mut self, step: &MigrationStep) {
        match step {
            MigrationStep::CreateTable(table) => {
                self.tables.entry(table.name.clone()).or_default();
            }
            MigrationStep::AddColumns { .. } => {
                // Documents carry their own fields; new columns need no
                // storage-level work here.
            }
        }
    }

    /// Apply a full migration and advance the version marker.
    pub fn apply_migration(&mut self, migration: &Migration) {
        for step in &migration.steps {
            self.apply_migration_step(step);
        }
        self.user_version = migration.to_version;
    }

    /// Replace the stored tables and local entries wholesale. Used by
    /// snapshot import; the caller has already validated the data.
    pub(crate) fn replace_contents(
        &mut self,
        tables: HashMap<TableName, Table>,
        local: HashMap<String, String>,
        user_version: SchemaVersion,
    ) {
        // Keep empty tables for schema tables absent from the import
        let mut merged: HashMap<TableName, Table> = HashMap::new();
        for name in self.schema.tables.keys() {
            merged.insert(name.clone(), Table::new());
        }
        for (name, table) in tables {
            merged.insert(name, table);
        }
        self.tables = merged;
        self.local = local;
        self.user_version = user_version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ColumnDef, ColumnType, Comparison, TableSchema};
    use serde_json::json;

    fn test_schema() -> Schema {
        Schema::new(1).with_table(TableSchema::new(
            "posts",
            vec![
                ColumnDef::required("title", ColumnType::String),
                ColumnDef::optional("likes", ColumnType::Int),
            ],
        ))
    }

    fn test_store() -> DocumentStore {
        DocumentStore::new(test_schema())
    }

    fn record(value: serde_json::Value) -> RawRecord {
        RawRecord::from_value(value).unwrap()
    }

    #[test]
    fn create_store() {
        let store = test_store();
        assert_eq!(store.user_version(), 1);
        assert!(store.table("posts").is_some());
        assert!(store.table("comments").is_none());
    }

    #[test]
    fn batch_create_and_find() {
        let mut store = test_store();

        store
            .batch(&[BatchOperation::create(
                "posts",
                "post-1",
                record(json!({"title": "Hello", "likes": 3})),
            )])
            .unwrap();

        let found = store.find("posts", "post-1").unwrap().unwrap();
        assert_eq!(found.id(), Some("post-1"));
        assert_eq!(found.get("title"), Some(&json!("Hello")));
        assert_eq!(found.status(), crate::RecordStatus::Created);
    }

    #[test]
    fn batch_create_duplicate_rolls_back() {
        let mut store = test_store();

        store
            .batch(&[BatchOperation::create(
                "posts",
                "post-1",
                record(json!({"title": "Hello"})),
            )])
            .unwrap();

        // Second batch: a valid create followed by a duplicate create.
        let result = store.batch(&[
            BatchOperation::create("posts", "post-2", record(json!({"title": "New"}))),
            BatchOperation::create("posts", "post-1", record(json!({"title": "Dup"}))),
        ]);
        assert!(matches!(
            result,
            Err(Error::RecordAlreadyExists { ref id, .. }) if id == "post-1"
        ));

        // Nothing from the failed batch is visible.
        assert!(store.find("posts", "post-2").unwrap().is_none());
        let original = store.find("posts", "post-1").unwrap().unwrap();
        assert_eq!(original.get("title"), Some(&json!("Hello")));
    }

    #[test]
    fn batch_update_missing_record() {
        let mut store = test_store();
        let result = store.batch(&[BatchOperation::update(
            "posts",
            "ghost",
            record(json!({"title": "Boo"})),
        )]);
        assert!(matches!(result, Err(Error::RecordNotFound { ref id, .. }) if id == "ghost"));
    }

    #[test]
    fn batch_later_ops_see_earlier_effects() {
        let mut store = test_store();

        // create, update, destroy of the same id in one batch: no trace left
        store
            .batch(&[
                BatchOperation::create("posts", "post-1", record(json!({"title": "A"}))),
                BatchOperation::update("posts", "post-1", record(json!({"title": "B"}))),
                BatchOperation::destroy_permanently("posts", "post-1"),
            ])
            .unwrap();

        assert!(store.find("posts", "post-1").unwrap().is_none());
        assert_eq!(store.table("posts").unwrap().len(), 0);
    }

    #[test]
    fn batch_create_then_update_equals_single_create() {
        let mut store = test_store();

        store
            .batch(&[
                BatchOperation::create("posts", "post-1", record(json!({"title": "A"}))),
                BatchOperation::update("posts", "post-1", record(json!({"title": "B"}))),
            ])
            .unwrap();

        let found = store.find("posts", "post-1").unwrap().unwrap();
        assert_eq!(found.get("title"), Some(&json!("B")));
    }

    #[test]
    fn destroy_missing_is_noop() {
        let mut store = test_store();
        store
            .batch(&[BatchOperation::destroy_permanently("posts", "ghost")])
            .unwrap();
    }

    #[test]
    fn batch_unknown_table() {
        let mut store = test_store();
        let result = store.batch(&[BatchOperation::create(
            "comments",
            "c-1",
            record(json!({"body": "hi"})),
        )]);
        assert!(matches!(result, Err(Error::TableNotFound(t)) if t == "comments"));
    }

    #[test]
    fn batch_invalid_payload_rolls_back() {
        let mut store = test_store();
        let result = store.batch(&[
            BatchOperation::create("posts", "post-1", record(json!({"title": "Ok"}))),
            BatchOperation::create("posts", "post-2", record(json!({"likes": 3}))),
        ]);
        assert!(matches!(result, Err(Error::MissingRequiredColumn(_))));
        assert!(store.find("posts", "post-1").unwrap().is_none());
    }

    #[test]
    fn query_filters_and_sorts() {
        let mut store = test_store();
        store
            .batch(&[
                BatchOperation::create(
                    "posts",
                    "post-1",
                    record(json!({"title": "A", "likes": 5})),
                ),
                BatchOperation::create(
                    "posts",
                    "post-2",
                    record(json!({"title": "B", "likes": 9})),
                ),
                BatchOperation::create(
                    "posts",
                    "post-3",
                    record(json!({"title": "C", "likes": 1})),
                ),
            ])
            .unwrap();

        let q = SerializedQuery::new("posts")
            .and_where("likes", Comparison::Gte(json!(2)))
            .sort_by("likes", crate::SortDirection::Desc);

        let ids = store.query_ids(&q).unwrap();
        assert_eq!(ids, vec!["post-2", "post-1"]);

        assert_eq!(store.count(&q).unwrap(), 2);
    }

    #[test]
    fn query_limit() {
        let mut store = test_store();
        store
            .batch(&[
                BatchOperation::create("posts", "post-1", record(json!({"title": "A"}))),
                BatchOperation::create("posts", "post-2", record(json!({"title": "B"}))),
            ])
            .unwrap();

        let q = SerializedQuery::new("posts").limit(1);
        assert_eq!(store.query(&q).unwrap().len(), 1);
    }

    #[test]
    fn soft_deleted_records_hidden_from_queries() {
        let mut store = test_store();
        store
            .batch(&[
                BatchOperation::create("posts", "post-1", record(json!({"title": "A"}))),
                BatchOperation::update(
                    "posts",
                    "post-1",
                    record(json!({"title": "A", "_status": "deleted"})),
                ),
            ])
            .unwrap();

        assert!(store.find("posts", "post-1").unwrap().is_none());
        assert_eq!(store.count(&SerializedQuery::new("posts")).unwrap(), 0);
        assert_eq!(
            store.deleted_record_ids("posts").unwrap(),
            vec!["post-1".to_string()]
        );

        // Raw queries skip the soft-delete filter
        let raw = store.query_raw(&SerializedQuery::new("posts")).unwrap();
        assert_eq!(raw.len(), 1);
    }

    #[test]
    fn local_storage_roundtrip() {
        let mut store = test_store();

        assert_eq!(store.get_local("k"), None);
        store.set_local("k", "v");
        assert_eq!(store.get_local("k"), Some("v"));
        store.set_local("k", "v2");
        assert_eq!(store.get_local("k"), Some("v2"));
        store.remove_local("k");
        assert_eq!(store.get_local("k"), None);
        // Removing again is fine
        store.remove_local("k");
    }

    #[test]
    fn destroy_everything() {
        let mut store = test_store();
        store
            .batch(&[BatchOperation::create(
                "posts",
                "post-1",
                record(json!({"title": "A"})),
            )])
            .unwrap();
        store.set_local("k", "v");

        store.destroy_everything();

        assert_eq!(store.user_version(), 0);
        assert_eq!(store.get_local("k"), None);
        assert!(store.query(&SerializedQuery::new("posts")).unwrap().is_empty());
    }

    #[test]
    fn migration_creates_table() {
        let mut store = test_store();
        let migration = Migration::new(
            2,
            vec![MigrationStep::CreateTable(TableSchema::new(
                "comments",
                vec![ColumnDef::required("body", ColumnType::String)],
            ))],
        );

        store.apply_migration(&migration);

        assert_eq!(store.user_version(), 2);
        assert!(store.table("comments").is_some());
    }

    #[test]
    fn store_serialization() {
        let mut store = test_store();
        store
            .batch(&[BatchOperation::create(
                "posts",
                "post-1",
                record(json!({"title": "A"})),
            )])
            .unwrap();
        store.set_local("k", "v");

        let json = serde_json::to_string(&store).unwrap();
        let restored: DocumentStore = serde_json::from_str(&json).unwrap();

        assert_eq!(store, restored);
    }
}
