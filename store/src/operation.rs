//! Batch operation types.
//!
//! Writes are expressed as batch operations, not direct mutations. A batch
//! is applied atomically: either every operation's effect becomes visible,
//! or none does.

use crate::{RawRecord, RecordId, TableName};
use serde::{Deserialize, Serialize};

/// One unit of work inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BatchOperation {
    /// Create a new record. Fails if the id already exists.
    Create {
        table: TableName,
        id: RecordId,
        record: RawRecord,
    },
    /// Replace an existing record's payload. Fails if the id is missing.
    Update {
        table: TableName,
        id: RecordId,
        record: RawRecord,
    },
    /// Remove a record entirely. A missing id is a no-op.
    DestroyPermanently { table: TableName, id: RecordId },
}

impl BatchOperation {
    /// Convenience constructor for a create.
    pub fn create(
        table: impl Into<TableName>,
        id: impl Into<RecordId>,
        record: RawRecord,
    ) -> Self {
        BatchOperation::Create {
            table: table.into(),
            id: id.into(),
            record,
        }
    }

    /// Convenience constructor for an update.
    pub fn update(
        table: impl Into<TableName>,
        id: impl Into<RecordId>,
        record: RawRecord,
    ) -> Self {
        BatchOperation::Update {
            table: table.into(),
            id: id.into(),
            record,
        }
    }

    /// Convenience constructor for a permanent destroy.
    pub fn destroy_permanently(table: impl Into<TableName>, id: impl Into<RecordId>) -> Self {
        BatchOperation::DestroyPermanently {
            table: table.into(),
            id: id.into(),
        }
    }

    /// The table this operation targets.
    pub fn table(&self) -> &TableName {
        match self {
            BatchOperation::Create { table, .. } => table,
            BatchOperation::Update { table, .. } => table,
            BatchOperation::DestroyPermanently { table, .. } => table,
        }
    }

    /// The record id this operation targets.
    pub fn id(&self) -> &RecordId {
        match self {
            BatchOperation::Create { id, .. } => id,
            BatchOperation::Update { id, .. } => id,
            BatchOperation::DestroyPermanently { id, .. } => id,
        }
    }

    /// The record payload, for create and update operations.
    pub fn record(&self) -> Option<&RawRecord> {
        match self {
            BatchOperation::Create { record, .. } => Some(record),
            BatchOperation::Update { record, .. } => Some(record),
            BatchOperation::DestroyPermanently { .. } => None,
        }
    }
}
