//! Pending operations and the condensation rules that keep at most
//! one of them per (table, item-id).

use serde::{Deserialize, Serialize};

use crate::item::Item;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }

    pub fn parse(raw: &str) -> Option<OpKind> {
        match raw {
            "insert" => Some(OpKind::Insert),
            "update" => Some(OpKind::Update),
            "delete" => Some(OpKind::Delete),
            _ => None,
        }
    }
}

/// Lifecycle state of a queued operation. Keeping the error on the
/// operation itself (rather than a sibling table) means the one-op-
/// per-item invariant also covers error records.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OpState {
    #[default]
    Pending,
    Errored {
        message: String,
        server_item: Option<Item>,
    },
}

impl OpState {
    pub fn is_errored(&self) -> bool {
        matches!(self, OpState::Errored { .. })
    }
}

/// A recorded local mutation awaiting push.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Monotonic within the context; assignment order is enqueue order.
    pub id: i64,
    pub table: String,
    pub item_id: String,
    pub kind: OpKind,
    /// For deletes, the pre-delete snapshot used to reconstruct the
    /// row on cancel and to carry the version to the server.
    pub item: Option<Item>,
    /// Bumped whenever the operation is condensed in place; lets the
    /// push runner detect mutations that raced an in-flight request.
    pub version: u32,
    pub state: OpState,
}

impl Operation {
    pub fn new(id: i64, table: impl Into<String>, item_id: impl Into<String>, kind: OpKind, item: Option<Item>) -> Operation {
        Operation {
            id,
            table: table.into(),
            item_id: item_id.into(),
            kind,
            item,
            version: 0,
            state: OpState::Pending,
        }
    }
}

/// What to do with the queue when a new mutation lands on an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondenseAction {
    /// No pending operation: append a fresh one.
    AddNew,
    /// The existing operation already covers the new mutation.
    Keep,
    /// Rewrite the existing operation into a delete, same id.
    ToDelete,
    /// Insert followed by delete cancels out; drop the operation.
    Discard,
    /// The combination is not allowed.
    NotSupported,
}

/// Condensation table: the server sees at most one operation per
/// (table, item-id) between sync cycles, and coalescing is safe
/// because the local store always holds the post-mutation state.
pub fn condense(existing: Option<OpKind>, incoming: OpKind) -> CondenseAction {
    use CondenseAction::*;
    use OpKind::*;

    match (existing, incoming) {
        (None, _) => AddNew,
        (Some(Insert), Update) => Keep,
        (Some(Insert), Delete) => Discard,
        (Some(Update), Update) => Keep,
        (Some(Update), Delete) => ToDelete,
        (Some(Insert | Update), Insert) => NotSupported,
        (Some(Delete), _) => NotSupported,
    }
}
