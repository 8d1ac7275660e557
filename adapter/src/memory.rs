//! In-memory storage backend.
//!
//! Wraps a [`DocumentStore`] and optionally persists it as a JSON snapshot
//! file. Persistence is write-behind: mutations mark the backend dirty and
//! the dispatcher's autosave tick (or `close`) flushes to disk. The
//! [`PersistenceTuning`] hooks observe and transform the snapshot on its way
//! to and from the file.

use crate::{
    backend::StorageBackend,
    call::RawStatement,
    config::PersistenceTuning,
    error::{AdapterError, Result},
};
use duffel_store::{
    migration_chain, BatchOperation, DocumentStore, Migration, MigrationStep, RawRecord, RecordId,
    Schema, SchemaVersion, SerializedQuery, StoreSnapshot, TableName,
};
use serde_json::Value;
use std::path::PathBuf;

/// `StorageBackend` over [`DocumentStore`], optionally file-backed.
pub struct MemoryBackend {
    store: DocumentStore,
    migrations: Vec<Migration>,
    snapshot_path: Option<PathBuf>,
    persistence: PersistenceTuning,
    dirty: bool,
    /// A snapshot file existed at set_up time and this instance has not yet
    /// written over it.
    foreign_file_on_disk: bool,
}

impl MemoryBackend {
    /// Create a memory backend. Nothing is read from disk until `set_up`.
    pub fn new(
        schema: Schema,
        migrations: Vec<Migration>,
        snapshot_path: Option<PathBuf>,
        persistence: PersistenceTuning,
    ) -> Self {
        Self {
            store: DocumentStore::new(schema),
            migrations,
            snapshot_path,
            persistence,
            dirty: false,
            foreign_file_on_disk: false,
        }
    }

    fn load_snapshot(&mut self) -> Result<()> {
        let Some(path) = self.snapshot_path.clone() else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        self.foreign_file_on_disk = true;

        if let Some(hook) = self.persistence.on_fetch_start.as_mut() {
            hook();
        }

        let mut text = std::fs::read_to_string(&path)
            .map_err(|e| AdapterError::SetUpFailure(format!("reading snapshot: {}", e)))?;
        if let Some(codec) = self.persistence.deserialize_chunk.as_ref() {
            text = codec(text);
        }

        let snapshot = StoreSnapshot::from_json(&text)
            .map_err(|e| AdapterError::SetUpFailure(e.to_string()))?;

        let stored = snapshot.schema_version;
        let target = self.store.schema().version;

        if stored == 0 {
            // An uninitialized snapshot; start fresh at the current version
            tracing::info!("discarding uninitialized snapshot");
            return Ok(());
        }
        if stored > target {
            return Err(AdapterError::SetUpFailure(format!(
                "snapshot version {} is newer than schema version {}",
                stored, target
            )));
        }

        if stored == target {
            snapshot
                .restore_into(&mut self.store)
                .map_err(|e| AdapterError::SetUpFailure(e.to_string()))?;
            tracing::info!(version = target, "restored snapshot");
            return Ok(());
        }

        // Older snapshot: migrate if the chain covers the gap, otherwise
        // abandon the persisted data and start fresh.
        match migration_chain(&self.migrations, stored, target) {
            Ok(chain) => {
                let mut snapshot = snapshot;
                for migration in chain {
                    tracing::info!(to_version = migration.to_version, "running migration");
                    for step in &migration.steps {
                        if let MigrationStep::CreateTable(table) = step {
                            snapshot.tables.entry(table.name.clone()).or_default();
                        }
                        // AddColumns needs no data-level work: documents
                        // carry their own fields and missing reads as null
                    }
                }
                snapshot.schema_version = target;
                snapshot
                    .restore_into(&mut self.store)
                    .map_err(|e| AdapterError::SetUpFailure(e.to_string()))?;
                self.dirty = true;
                Ok(())
            }
            Err(_) => {
                tracing::warn!(
                    stored,
                    target,
                    "no migration path for persisted snapshot; starting empty"
                );
                if let Some(hook) = self.persistence.on_version_change.as_mut() {
                    hook(stored, target);
                }
                self.dirty = true;
                Ok(())
            }
        }
    }

    fn save(&mut self) -> Result<()> {
        let Some(path) = self.snapshot_path.clone() else {
            self.dirty = false;
            return Ok(());
        };

        if self.foreign_file_on_disk {
            if let Some(hook) = self.persistence.on_overwrite.as_mut() {
                hook();
            }
        }

        let snapshot = StoreSnapshot::capture(&self.store);
        let mut text = snapshot
            .to_json()
            .map_err(|e| AdapterError::storage(e.to_string()))?;
        if let Some(codec) = self.persistence.serialize_chunk.as_ref() {
            text = codec(text);
        }

        // Write-then-rename so a crash mid-write cannot corrupt the snapshot
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, text)
            .map_err(|e| AdapterError::storage(format!("writing snapshot: {}", e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| AdapterError::storage(format!("writing snapshot: {}", e)))?;

        tracing::debug!(records = snapshot.record_count(), "saved snapshot");
        self.foreign_file_on_disk = false;
        self.dirty = false;
        Ok(())
    }
}

impl StorageBackend for MemoryBackend {
    fn set_up(&mut self) -> Result<()> {
        self.load_snapshot()
    }

    fn find(&mut self, table: &TableName, id: &RecordId) -> Result<Option<RawRecord>> {
        Ok(self.store.find(table, id)?.cloned())
    }

    fn query(&mut self, query: &SerializedQuery) -> Result<Vec<RawRecord>> {
        Ok(self.store.query(query)?.into_iter().cloned().collect())
    }

    fn query_ids(&mut self, query: &SerializedQuery) -> Result<Vec<RecordId>> {
        Ok(self.store.query_ids(query)?)
    }

    fn unsafe_query_raw(&mut self, query: &SerializedQuery) -> Result<Vec<Value>> {
        Ok(self.store.query_raw(query)?)
    }

    fn count(&mut self, query: &SerializedQuery) -> Result<usize> {
        Ok(self.store.count(query)?)
    }

    fn batch(&mut self, operations: &[BatchOperation]) -> Result<()> {
        self.store.batch(operations)?;
        self.dirty = true;
        Ok(())
    }

    fn get_deleted_records(&mut self, table: &TableName) -> Result<Vec<RecordId>> {
        Ok(self.store.deleted_record_ids(table)?)
    }

    fn unsafe_execute(&mut self, _statements: &[RawStatement]) -> Result<()> {
        Err(AdapterError::storage(
            "raw SQL execution is not supported by the memory backend",
        ))
    }

    fn get_local(&mut self, key: &str) -> Result<Option<String>> {
        Ok(self.store.get_local(key).map(str::to_string))
    }

    fn set_local(&mut self, key: &str, value: &str) -> Result<()> {
        self.store.set_local(key, value);
        self.dirty = true;
        Ok(())
    }

    fn remove_local(&mut self, key: &str) -> Result<()> {
        self.store.remove_local(key);
        self.dirty = true;
        Ok(())
    }

    fn unsafe_reset(&mut self) -> Result<()> {
        tracing::warn!("resetting database: dropping all records");
        self.store.destroy_everything();
        self.dirty = false;
        if let Some(path) = &self.snapshot_path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(AdapterError::storage(format!(
                        "removing snapshot: {}",
                        e
                    )))
                }
            }
            self.foreign_file_on_disk = false;
        }
        Ok(())
    }

    fn user_version(&mut self) -> Result<SchemaVersion> {
        Ok(self.store.user_version())
    }

    fn autosave_tick(&mut self) -> Result<()> {
        if self.dirty {
            self.save()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        tracing::debug!("closing memory backend");
        if self.dirty {
            self.save()?;
        }
        Ok(())
    }
}
