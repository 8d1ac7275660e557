//! Call envelopes: the unit of work sent to the dispatcher.
//!
//! Every adapter operation becomes one [`CallEnvelope`]: a closed,
//! strongly-typed [`DbCall`] variant, the two cloning policies, and a
//! one-shot reply channel. The variant match replaces runtime method lookup
//! with a compile-time-checked dispatch.

use crate::{clone::ClonePolicy, error::AdapterError};
use duffel_store::{BatchOperation, RawRecord, RecordId, SerializedQuery, TableName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// A raw statement for `unsafe_execute`: SQL with positional JSON arguments.
/// Only the relational backend can run these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStatement {
    pub sql: String,
    pub args: Vec<Value>,
}

impl RawStatement {
    /// Create a raw statement.
    pub fn new(sql: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }
}

/// The closed set of operations a backend understands.
#[derive(Debug, Clone)]
pub enum DbCall {
    Find {
        table: TableName,
        id: RecordId,
    },
    Query {
        query: Arc<SerializedQuery>,
    },
    QueryIds {
        query: Arc<SerializedQuery>,
    },
    UnsafeQueryRaw {
        query: Arc<SerializedQuery>,
    },
    Count {
        query: Arc<SerializedQuery>,
    },
    Batch {
        operations: Vec<BatchOperation>,
    },
    GetDeletedRecords {
        table: TableName,
    },
    UnsafeExecute {
        statements: Vec<RawStatement>,
    },
    GetLocal {
        key: String,
    },
    SetLocal {
        key: String,
        value: String,
    },
    RemoveLocal {
        key: String,
    },
    UnsafeResetDatabase,
}

impl DbCall {
    /// Short name for logging.
    pub fn method(&self) -> &'static str {
        match self {
            DbCall::Find { .. } => "find",
            DbCall::Query { .. } => "query",
            DbCall::QueryIds { .. } => "queryIds",
            DbCall::UnsafeQueryRaw { .. } => "unsafeQueryRaw",
            DbCall::Count { .. } => "count",
            DbCall::Batch { .. } => "batch",
            DbCall::GetDeletedRecords { .. } => "getDeletedRecords",
            DbCall::UnsafeExecute { .. } => "unsafeExecute",
            DbCall::GetLocal { .. } => "getLocal",
            DbCall::SetLocal { .. } => "setLocal",
            DbCall::RemoveLocal { .. } => "removeLocal",
            DbCall::UnsafeResetDatabase => "unsafeResetDatabase",
        }
    }
}

/// The result of a successfully executed call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallResult {
    Record(Option<RawRecord>),
    Records(Vec<RawRecord>),
    Ids(Vec<RecordId>),
    Rows(Vec<Value>),
    Count(usize),
    Local(Option<String>),
    Done,
}

impl CallResult {
    pub(crate) fn into_record(self) -> Result<Option<RawRecord>, AdapterError> {
        match self {
            CallResult::Record(r) => Ok(r),
            other => Err(shape_error("record", &other)),
        }
    }

    pub(crate) fn into_records(self) -> Result<Vec<RawRecord>, AdapterError> {
        match self {
            CallResult::Records(r) => Ok(r),
            other => Err(shape_error("records", &other)),
        }
    }

    pub(crate) fn into_ids(self) -> Result<Vec<RecordId>, AdapterError> {
        match self {
            CallResult::Ids(ids) => Ok(ids),
            other => Err(shape_error("ids", &other)),
        }
    }

    pub(crate) fn into_rows(self) -> Result<Vec<Value>, AdapterError> {
        match self {
            CallResult::Rows(rows) => Ok(rows),
            other => Err(shape_error("rows", &other)),
        }
    }

    pub(crate) fn into_count(self) -> Result<usize, AdapterError> {
        match self {
            CallResult::Count(n) => Ok(n),
            other => Err(shape_error("count", &other)),
        }
    }

    pub(crate) fn into_local(self) -> Result<Option<String>, AdapterError> {
        match self {
            CallResult::Local(v) => Ok(v),
            other => Err(shape_error("local", &other)),
        }
    }

    pub(crate) fn into_done(self) -> Result<(), AdapterError> {
        match self {
            CallResult::Done => Ok(()),
            other => Err(shape_error("done", &other)),
        }
    }
}

fn shape_error(expected: &str, got: &CallResult) -> AdapterError {
    AdapterError::Fatal(format!(
        "backend returned mismatched result shape: expected {}, got {:?}",
        expected, got
    ))
}

/// The reply side of an envelope.
pub type ReplySender = oneshot::Sender<Result<CallResult, AdapterError>>;

/// One queued unit of work.
pub struct CallEnvelope {
    pub call: DbCall,
    /// Policy already applied to the arguments at construction; carried for
    /// observability.
    pub arg_policy: ClonePolicy,
    /// Policy the execution context applies to the result before replying.
    pub result_policy: ClonePolicy,
    pub reply: ReplySender,
}

impl std::fmt::Debug for CallEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEnvelope")
            .field("method", &self.call.method())
            .field("arg_policy", &self.arg_policy)
            .field("result_policy", &self.result_policy)
            .finish()
    }
}

/// A pending call's result, as a future.
///
/// The underlying call was already submitted (FIFO position fixed) when the
/// handle was created; polling only waits for the reply.
#[derive(Debug)]
pub struct CallHandle<T> {
    rx: oneshot::Receiver<Result<CallResult, AdapterError>>,
    convert: fn(CallResult) -> Result<T, AdapterError>,
}

impl<T> CallHandle<T> {
    pub(crate) fn new(
        rx: oneshot::Receiver<Result<CallResult, AdapterError>>,
        convert: fn(CallResult) -> Result<T, AdapterError>,
    ) -> Self {
        Self { rx, convert }
    }
}

impl<T> Future for CallHandle<T> {
    type Output = Result<T, AdapterError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(Ok(result))) => Poll::Ready((self.convert)(result)),
            Poll::Ready(Ok(Err(err))) => Poll::Ready(Err(err)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(AdapterError::Fatal(
                "dispatcher terminated before replying".into(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names() {
        let call = DbCall::GetLocal { key: "k".into() };
        assert_eq!(call.method(), "getLocal");
        assert_eq!(DbCall::UnsafeResetDatabase.method(), "unsafeResetDatabase");
    }

    #[test]
    fn result_shape_conversions() {
        assert_eq!(CallResult::Count(3).into_count().unwrap(), 3);
        assert_eq!(
            CallResult::Local(Some("v".into())).into_local().unwrap(),
            Some("v".to_string())
        );
        assert!(CallResult::Done.into_done().is_ok());

        let err = CallResult::Done.into_count().unwrap_err();
        assert!(matches!(err, AdapterError::Fatal(_)));
    }

    #[tokio::test]
    async fn handle_resolves_reply() {
        let (tx, rx) = oneshot::channel();
        let handle: CallHandle<usize> = CallHandle::new(rx, CallResult::into_count);

        tx.send(Ok(CallResult::Count(7))).unwrap();
        assert_eq!(handle.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn handle_maps_dropped_dispatcher_to_fatal() {
        let (tx, rx) = oneshot::channel::<Result<CallResult, AdapterError>>();
        let handle: CallHandle<usize> = CallHandle::new(rx, CallResult::into_count);
        drop(tx);

        assert!(matches!(handle.await, Err(AdapterError::Fatal(_))));
    }
}
