//! Cloning policy for values crossing the execution-context boundary.
//!
//! Each call envelope carries one policy for its arguments and one for its
//! result. The policy decides whether a value is shared by reference or
//! detached into a deep copy before it changes hands. Record data conforms
//! to the JSON model by construction (`serde_json::Value` is closed), so
//! applying a policy cannot fail.

use duffel_store::{BatchOperation, RawRecord};
use serde::{Deserialize, Serialize};

/// How a value is passed across the context boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClonePolicy {
    /// The value's entire reachable graph is never mutated after the call;
    /// share it by reference (an `Arc` bump for records and queries).
    Immutable,
    /// Copy the top level; nested plain objects and arrays are deep-copied
    /// with it. The receiving side owns the copy outright.
    ShallowCloneDeepObjects,
}

impl ClonePolicy {
    /// Apply the policy to a single record.
    pub fn apply_record(self, record: &RawRecord) -> RawRecord {
        match self {
            ClonePolicy::Immutable => record.clone(),
            ClonePolicy::ShallowCloneDeepObjects => record.deep_clone(),
        }
    }

    /// Apply the policy to a result set of records.
    pub fn apply_records(self, records: Vec<RawRecord>) -> Vec<RawRecord> {
        match self {
            ClonePolicy::Immutable => records,
            ClonePolicy::ShallowCloneDeepObjects => {
                records.iter().map(RawRecord::deep_clone).collect()
            }
        }
    }

    /// Apply the policy to a borrowed sequence of batch operations,
    /// producing the owned sequence the envelope will carry.
    pub fn apply_operations(self, operations: &[BatchOperation]) -> Vec<BatchOperation> {
        operations
            .iter()
            .map(|op| match op {
                BatchOperation::Create { table, id, record } => BatchOperation::Create {
                    table: table.clone(),
                    id: id.clone(),
                    record: self.apply_record(record),
                },
                BatchOperation::Update { table, id, record } => BatchOperation::Update {
                    table: table.clone(),
                    id: id.clone(),
                    record: self.apply_record(record),
                },
                BatchOperation::DestroyPermanently { table, id } => {
                    BatchOperation::DestroyPermanently {
                        table: table.clone(),
                        id: id.clone(),
                    }
                }
            })
            .collect()
    }
}
