//! Snapshot types for persisting and restoring store state.
//!
//! Snapshots are the bridge between the in-memory document store and
//! persistent storage. They serialize deterministically so that identical
//! states produce identical bytes.

use crate::{
    error::Result, store::Table, DocumentStore, Error, RawRecord, RecordId, Schema, SchemaVersion,
    TableName,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of the store state.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Schema version marker at time of snapshot
    pub schema_version: SchemaVersion,
    /// All records organized by table, then by record id
    pub tables: BTreeMap<TableName, BTreeMap<RecordId, RawRecord>>,
    /// Local key/value entries
    pub local: BTreeMap<String, String>,
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new(schema_version: SchemaVersion) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            tables: BTreeMap::new(),
            local: BTreeMap::new(),
        }
    }

    /// Capture the current state of a store.
    pub fn capture(store: &DocumentStore) -> Self {
        let mut snapshot = Self::new(store.user_version());

        for name in store.schema().tables.keys() {
            if let Some(table) = store.table(name) {
                let records: BTreeMap<RecordId, RawRecord> = table
                    .all_records()
                    .filter_map(|r| r.id().map(|id| (id.to_string(), r.clone())))
                    .collect();
                snapshot.tables.insert(name.clone(), records);
            }
        }

        for (key, value) in store.local_entries() {
            snapshot.local.insert(key.clone(), value.clone());
        }

        snapshot
    }

    /// Restore a store's contents from this snapshot.
    ///
    /// The snapshot's schema version must match the store's schema; version
    /// differences are the caller's problem (migrate or reset first).
    pub fn restore_into(self, store: &mut DocumentStore) -> Result<()> {
        if self.schema_version != store.schema().version {
            return Err(Error::SchemaVersionMismatch {
                expected: store.schema().version,
                actual: self.schema_version,
            });
        }

        let mut tables: HashMap<TableName, Table> = HashMap::new();
        for (name, records) in self.tables {
            if !store.schema().has_table(&name) {
                return Err(Error::TableNotFound(name));
            }
            let mut table = Table::new();
            for (id, record) in records {
                table.insert(id, record);
            }
            tables.insert(name, table);
        }

        let local: HashMap<String, String> = self.local.into_iter().collect();
        let version = self.schema_version;
        store.replace_contents(tables, local, version);
        Ok(())
    }

    /// Count total records across all tables.
    pub fn record_count(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum()
    }

    /// Validate the snapshot against a schema without restoring it.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        if self.schema_version != schema.version {
            return Err(Error::SchemaVersionMismatch {
                expected: schema.version,
                actual: self.schema_version,
            });
        }
        for name in self.tables.keys() {
            if !schema.has_table(name) {
                return Err(Error::TableNotFound(name.clone()));
            }
        }
        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}
