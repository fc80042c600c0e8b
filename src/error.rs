use thiserror::Error;

use crate::item::Item;
use crate::op::OpKind;
use crate::remote::RemoteError;
use crate::store::StoreError;

/// Record of a single operation that failed during a push drain.
///
/// These are collected by the push runner and also persisted on the
/// operation itself, so an application can inspect and resolve them
/// (see [`crate::context::SyncContext::cancel_and_update`]).
#[derive(Debug, Clone)]
pub struct OperationError {
    pub operation_id: i64,
    pub table: String,
    pub item_id: String,
    pub op_kind: OpKind,
    pub message: String,
    /// Server copy of the item, when the server returned one (conflict
    /// and precondition failures).
    pub server_item: Option<Item>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("invalid query id: {0:?}")]
    InvalidQueryId(String),
    #[error("unsupported action: {0}")]
    InvalidAction(&'static str),
    #[error("a pending operation already exists for {table}/{item_id}")]
    QueueConflict { table: String, item_id: String },
    #[error("data source failure")]
    Store(#[from] StoreError),
    /// The local row was written but the operation queue update failed,
    /// so local data and the queue no longer agree. The application
    /// must resolve this (typically by re-issuing the mutation).
    #[error("local store and operation queue diverged")]
    StoreInconsistent(#[source] StoreError),
    #[error("remote failure")]
    Remote(#[from] RemoteError),
    /// Aggregate result of a push drain. `cause` is set when a
    /// transport or authorization failure stopped the drain early;
    /// without it the drain completed but collected per-op errors.
    #[error("push failed with {} operation error(s)", op_errors.len())]
    PushAborted {
        cause: Option<RemoteError>,
        op_errors: Vec<OperationError>,
    },
    #[error("push cancelled")]
    PushCancelled,
    #[error("pull aborted")]
    PullAborted(#[source] Box<Error>),
    #[error("pull cancelled")]
    PullCancelled,
    #[error("purge aborted: table has pending operations")]
    PurgeAborted,
    #[error("operation changed while the request was in flight")]
    OperationChanged,
    #[error("sync context was dropped")]
    ContextClosed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
