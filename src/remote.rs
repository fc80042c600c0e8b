//! Remote table seam. The engine drives this trait; the HTTP client
//! behind it is the host SDK's concern.

use thiserror::Error;

use crate::item::Item;
use crate::query::Query;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transport: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("authorization rejected")]
    Auth,
    /// Server rejected the write because its copy changed (HTTP 409).
    #[error("conflict: the server holds a different version")]
    Conflict { server_item: Option<Item> },
    /// Optimistic concurrency check failed (HTTP 412).
    #[error("precondition failed")]
    PreconditionFailed { server_item: Option<Item> },
    #[error("server rejected the request: {status} {message}")]
    Validation { status: u16, message: String },
    #[error("item not found on the server")]
    NotFound,
}

impl RemoteError {
    /// Transport and credential failures abort a whole push drain;
    /// everything else stays isolated to the operation that caused it.
    pub fn aborts_push(&self) -> bool {
        matches!(self, RemoteError::Transport(_) | RemoteError::Auth)
    }

    pub fn server_item(&self) -> Option<&Item> {
        match self {
            RemoteError::Conflict { server_item } | RemoteError::PreconditionFailed { server_item } => {
                server_item.as_ref()
            }
            _ => None,
        }
    }
}

/// One page of server rows, in server order.
#[derive(Debug, Default)]
pub struct Page {
    pub items: Vec<Item>,
}

/// Server-side table CRUD and query.
pub trait RemoteClient: Send + Sync {
    /// Create `item` on the server; returns the server-authoritative
    /// copy (id, `__version`, `__updatedAt` filled in).
    fn insert(&self, table: &str, item: &Item) -> Result<Item, RemoteError>;

    /// Replace the server copy; `__version` on `item`, when present,
    /// is the optimistic concurrency precondition.
    fn update(&self, table: &str, item: &Item) -> Result<Item, RemoteError>;

    fn delete(&self, table: &str, item_id: &str, version: Option<&str>) -> Result<(), RemoteError>;

    fn query(&self, query: &Query) -> Result<Page, RemoteError>;
}
