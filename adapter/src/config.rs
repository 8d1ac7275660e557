//! Adapter configuration.

use crate::error::AdapterError;
use duffel_store::{Migration, Schema};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Hook invoked once if the backend fails to set up.
pub type SetUpErrorHook = Box<dyn FnOnce(AdapterError) + Send>;

/// Hook invoked once when an unrecoverable backend condition is observed.
pub type FatalErrorHook = Box<dyn FnOnce(AdapterError) + Send>;

/// Transform applied to serialized snapshot text on its way to/from disk.
pub type ChunkCodec = Arc<dyn Fn(String) -> String + Send + Sync>;

/// Hook invoked when the persisted schema version differs from the
/// configured one and no migration chain covers the gap: `(stored, target)`.
pub type VersionChangeHook = Box<dyn FnMut(u32, u32) + Send>;

/// Which storage engine backs the adapter.
#[derive(Debug, Clone)]
pub enum BackendKind {
    /// Transactional relational engine. `:memory:` is accepted as a path.
    Sqlite { path: PathBuf },
    /// In-process document store, optionally persisted as a snapshot file.
    Memory { snapshot_path: Option<PathBuf> },
}

/// Tuning for the backend's write-back behavior.
#[derive(Debug, Clone)]
pub struct BackendTuning {
    /// Persist dirty state periodically (memory backend only).
    pub autosave: bool,
    /// How often the autosave tick fires.
    pub autosave_interval: Duration,
}

impl Default for BackendTuning {
    fn default() -> Self {
        Self {
            autosave: true,
            autosave_interval: Duration::from_millis(500),
        }
    }
}

/// Hooks into the memory backend's snapshot persistence.
#[derive(Default)]
pub struct PersistenceTuning {
    /// Fired before the first save that replaces a snapshot file this
    /// adapter instance did not write.
    pub on_overwrite: Option<Box<dyn FnMut() + Send>>,
    /// Fired when a persisted snapshot is abandoned due to an uncovered
    /// version change.
    pub on_version_change: Option<VersionChangeHook>,
    /// Transform applied to snapshot text before it is written.
    pub serialize_chunk: Option<ChunkCodec>,
    /// Transform applied to snapshot text after it is read.
    pub deserialize_chunk: Option<ChunkCodec>,
    /// Fired just before the persisted snapshot is loaded.
    pub on_fetch_start: Option<Box<dyn FnMut() + Send>>,
}

/// Full configuration for an adapter instance.
pub struct AdapterConfig {
    /// Logical database name, used for logging and defaults.
    pub name: String,
    /// The active schema; every table-name argument is validated against it.
    pub schema: Schema,
    /// Migrations available to upgrade older stored data.
    pub migrations: Vec<Migration>,
    /// Storage engine selection.
    pub backend: BackendKind,
    /// Run the backend behind its own execution context (default), or
    /// execute calls inline on the caller's thread.
    pub use_isolated_execution_context: bool,
    /// Invoked once if setup fails; the adapter is unusable afterward.
    pub on_setup_error: Option<SetUpErrorHook>,
    /// Invoked once if write capacity is exhausted mid-operation.
    pub on_quota_exceeded_error: Option<FatalErrorHook>,
    /// Write-back tuning.
    pub tuning: BackendTuning,
    /// Snapshot persistence hooks (memory backend only).
    pub persistence: PersistenceTuning,
}

impl AdapterConfig {
    /// Configuration with defaults: isolated context, autosave on.
    pub fn new(name: impl Into<String>, schema: Schema, backend: BackendKind) -> Self {
        Self {
            name: name.into(),
            schema,
            migrations: Vec::new(),
            backend,
            use_isolated_execution_context: true,
            on_setup_error: None,
            on_quota_exceeded_error: None,
            tuning: BackendTuning::default(),
            persistence: PersistenceTuning::default(),
        }
    }

    /// Builder-style: set the migrations.
    pub fn with_migrations(mut self, migrations: Vec<Migration>) -> Self {
        self.migrations = migrations;
        self
    }

    /// Builder-style: execute calls inline instead of in an isolated context.
    pub fn inline_execution(mut self) -> Self {
        self.use_isolated_execution_context = false;
        self
    }

    /// Builder-style: set the setup-error hook.
    pub fn on_setup_error(mut self, hook: SetUpErrorHook) -> Self {
        self.on_setup_error = Some(hook);
        self
    }

    /// Builder-style: set the quota-exceeded hook.
    pub fn on_quota_exceeded_error(mut self, hook: FatalErrorHook) -> Self {
        self.on_quota_exceeded_error = Some(hook);
        self
    }

    /// Builder-style: set the write-back tuning.
    pub fn with_tuning(mut self, tuning: BackendTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Builder-style: set the persistence hooks.
    pub fn with_persistence(mut self, persistence: PersistenceTuning) -> Self {
        self.persistence = persistence;
        self
    }
}

impl std::fmt::Debug for AdapterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterConfig")
            .field("name", &self.name)
            .field("schema_version", &self.schema.version)
            .field("backend", &self.backend)
            .field(
                "use_isolated_execution_context",
                &self.use_isolated_execution_context,
            )
            .field("tuning", &self.tuning)
            .finish_non_exhaustive()
    }
}
