//! The sync coordinator. Owns the writer domain, routes local
//! mutations through condensation, and schedules push, pull and purge.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::exec::{BoundedExecutor, CallbackExecutor, SerialLane};
use crate::item::{self, Item};
use crate::op::{CondenseAction, OpKind, OpState, Operation, condense};
use crate::pull;
use crate::push::{self, PushHandler};
use crate::query::Query;
use crate::queue::OperationQueue;
use crate::remote::RemoteClient;
use crate::store::DataSource;
use crate::table::SyncTable;

/// Completion callback. Every public entry point returns immediately
/// and later invokes its completion exactly once, on the callback
/// executor.
pub type Completion<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Per-context tunables.
pub struct Settings {
    /// Server page size used by pull.
    pub page_size: u32,
    /// Worker count for the bundled callback executor. Ignored when
    /// `callback_executor` is supplied.
    pub callback_workers: usize,
    /// Embedder-provided completion executor.
    pub callback_executor: Option<Arc<dyn CallbackExecutor>>,
    /// Optional hook replacing the default remote call per operation.
    pub push_handler: Option<Arc<dyn PushHandler>>,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            page_size: 50,
            callback_workers: BoundedExecutor::DEFAULT_WORKERS,
            callback_executor: None,
            push_handler: None,
        }
    }
}

pub(crate) struct ContextInner {
    pub(crate) store: Arc<dyn DataSource>,
    pub(crate) remote: Arc<dyn RemoteClient>,
    pub(crate) queue: OperationQueue,
    pub(crate) writer: SerialLane,
    sync_lane: SerialLane,
    pub(crate) callbacks: Arc<dyn CallbackExecutor>,
    pub(crate) push_handler: Option<Arc<dyn PushHandler>>,
    cancelled: AtomicBool,
    pub(crate) page_size: u32,
}

impl ContextInner {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Handle to the sync engine. Clones share one engine; push and pull
/// tasks hold only weak references to it, so dropping the last handle
/// cancels whatever is still outstanding.
pub struct SyncContext {
    inner: Arc<ContextInner>,
}

impl Clone for SyncContext {
    fn clone(&self) -> SyncContext {
        SyncContext { inner: Arc::clone(&self.inner) }
    }
}

impl SyncContext {
    pub fn open(store: Arc<dyn DataSource>, remote: Arc<dyn RemoteClient>) -> Result<SyncContext> {
        SyncContext::with_settings(store, remote, Settings::default())
    }

    pub fn with_settings(
        store: Arc<dyn DataSource>,
        remote: Arc<dyn RemoteClient>,
        settings: Settings,
    ) -> Result<SyncContext> {
        let queue = OperationQueue::open(Arc::clone(&store))?;
        let pending = queue.count()?;
        let callbacks = match settings.callback_executor {
            Some(executor) => executor,
            None => Arc::new(BoundedExecutor::new(settings.callback_workers)?),
        };
        let inner = Arc::new(ContextInner {
            store,
            remote,
            queue,
            writer: SerialLane::spawn("offsync-writer")?,
            sync_lane: SerialLane::spawn("offsync-sync")?,
            callbacks,
            push_handler: settings.push_handler,
            cancelled: AtomicBool::new(false),
            page_size: settings.page_size.max(1),
        });
        info!(pending, "sync context ready");
        Ok(SyncContext { inner })
    }

    /// Bind a named table to this context.
    pub fn table(&self, name: impl Into<String>) -> SyncTable {
        SyncTable::new(self.clone(), name.into())
    }

    /// Drain every pending operation to the server, in enqueue order.
    pub fn push(&self, completion: Completion<()>) {
        let weak = Arc::downgrade(&self.inner);
        let callbacks = Arc::clone(&self.inner.callbacks);
        self.inner.sync_lane.submit(Box::new(move || {
            let result = push::run(&weak);
            callbacks.submit(Box::new(move || completion(result)));
        }));
    }

    pub(crate) fn schedule_pull(&self, query: Query, query_id: Option<String>, completion: Completion<u64>) {
        let weak = Arc::downgrade(&self.inner);
        let callbacks = Arc::clone(&self.inner.callbacks);
        self.inner.sync_lane.submit(Box::new(move || {
            let result = pull::run(&weak, query, query_id.as_deref());
            callbacks.submit(Box::new(move || completion(result)));
        }));
    }

    pub(crate) fn schedule_purge(
        &self,
        query: Query,
        query_id: Option<String>,
        force: bool,
        completion: Completion<()>,
    ) {
        let weak = Arc::downgrade(&self.inner);
        let callbacks = Arc::clone(&self.inner.callbacks);
        self.inner.writer.submit(Box::new(move || {
            let result = match weak.upgrade() {
                Some(inner) => pull::run_purge(&inner, &query, query_id.as_deref(), force),
                None => Err(Error::ContextClosed),
            };
            callbacks.submit(Box::new(move || completion(result)));
        }));
    }

    pub(crate) fn apply_local_mutation(
        &self,
        table: String,
        mut item: Item,
        kind: OpKind,
        completion: Completion<Item>,
    ) {
        // Identity is settled before entering the writer domain, so a
        // malformed item fails fast and inserts get their UUID.
        let item_id = match item::id(&item) {
            Some(id) => id.to_string(),
            None if kind == OpKind::Insert => {
                let fresh = Uuid::new_v4().to_string();
                item::set_id(&mut item, fresh.clone());
                fresh
            }
            None => {
                return self.finish(completion, Err(Error::InvalidParameter("item is missing a string `id`")));
            }
        };
        let weak = Arc::downgrade(&self.inner);
        let callbacks = Arc::clone(&self.inner.callbacks);
        self.inner.writer.submit(Box::new(move || {
            let result = match weak.upgrade() {
                Some(inner) => mutate(&inner, &table, item, kind, &item_id),
                None => Err(Error::ContextClosed),
            };
            callbacks.submit(Box::new(move || completion(result)));
        }));
    }

    /// Every queued operation, in operation-id order.
    pub fn pending_operations(&self) -> Result<Vec<Operation>> {
        self.inner.queue.all()
    }

    pub fn pending_count(&self) -> Result<u64> {
        self.inner.queue.count()
    }

    /// Resolve a queued (typically errored) operation by replacing the
    /// local item with `corrected` and dropping the operation. System
    /// fields other than `__version` are stripped from `corrected`.
    pub fn cancel_and_update(&self, op: Operation, corrected: Item, completion: Completion<()>) {
        self.schedule_cancel(op, Some(corrected), completion);
    }

    /// Resolve a queued operation by deleting the local row and
    /// dropping the operation.
    pub fn cancel_and_discard(&self, op: Operation, completion: Completion<()>) {
        self.schedule_cancel(op, None, completion);
    }

    fn schedule_cancel(&self, op: Operation, corrected: Option<Item>, completion: Completion<()>) {
        let weak = Arc::downgrade(&self.inner);
        let callbacks = Arc::clone(&self.inner.callbacks);
        self.inner.writer.submit(Box::new(move || {
            let result = match weak.upgrade() {
                Some(inner) => run_cancel(&inner, &op, corrected),
                None => Err(Error::ContextClosed),
            };
            callbacks.submit(Box::new(move || completion(result)));
        }));
    }

    pub(crate) fn data_source(&self) -> &dyn DataSource {
        self.inner.store.as_ref()
    }

    pub(crate) fn finish<T: Send + 'static>(&self, completion: Completion<T>, result: Result<T>) {
        self.inner.callbacks.submit(Box::new(move || completion(result)));
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        // The last handle going away cancels outstanding sync tasks
        // before the lanes are joined.
        if Arc::strong_count(&self.inner) == 1 {
            self.inner.cancelled.store(true, Ordering::Relaxed);
        }
    }
}

/// Writer-domain body of a local mutation: condense, write the local
/// store, then reflect the decision in the queue.
fn mutate(inner: &ContextInner, table: &str, item: Item, kind: OpKind, item_id: &str) -> Result<Item> {
    let existing = inner.queue.op_for_item(table, item_id)?;
    let action = condense(existing.as_ref().map(|op| op.kind), kind);
    debug!(table, item_id, ?kind, ?action, "local mutation");

    if action == CondenseAction::NotSupported {
        return Err(Error::InvalidAction(
            "the mutation cannot be combined with the item's pending operation",
        ));
    }

    let snapshot = match kind {
        OpKind::Insert | OpKind::Update => {
            inner.store.upsert(table, std::slice::from_ref(&item))?;
            None
        }
        OpKind::Delete => {
            let before = inner.store.read(table, item_id)?;
            inner.store.delete(table, &[item_id.to_string()])?;
            before.or_else(|| Some(item.clone()))
        }
    };

    if let Err(err) = apply_condense_action(inner, table, item_id, kind, action, existing, snapshot) {
        error!(table, item_id, error = %err, "queue write failed after local store write");
        return Err(match err {
            Error::Store(cause) => Error::StoreInconsistent(cause),
            other => other,
        });
    }
    Ok(item)
}

fn apply_condense_action(
    inner: &ContextInner,
    table: &str,
    item_id: &str,
    kind: OpKind,
    action: CondenseAction,
    existing: Option<Operation>,
    snapshot: Option<Item>,
) -> Result<()> {
    match (action, existing) {
        (CondenseAction::AddNew, _) => {
            let op = Operation::new(inner.queue.next_operation_id(), table, item_id, kind, snapshot);
            inner.queue.add(&op)
        }
        (CondenseAction::Keep, Some(_)) => Ok(()),
        (CondenseAction::ToDelete, Some(mut op)) => {
            op.kind = OpKind::Delete;
            op.item = snapshot;
            op.version += 1;
            op.state = OpState::Pending;
            inner.queue.update(&op)
        }
        (CondenseAction::Discard, Some(op)) => {
            debug!(table, item_id, op_id = op.id, "insert followed by delete cancelled out");
            inner.queue.remove(op.id)
        }
        // condense() never yields these shapes.
        _ => Err(Error::InvalidAction("no pending operation to condense into")),
    }
}

fn run_cancel(inner: &ContextInner, op: &Operation, corrected: Option<Item>) -> Result<()> {
    let current = inner.queue.op_for_item(&op.table, &op.item_id)?;
    let unchanged = current
        .as_ref()
        .is_some_and(|cur| cur.id == op.id && cur.version == op.version);
    if !unchanged {
        return Err(Error::OperationChanged);
    }
    match corrected {
        Some(corrected) => {
            let mut kept = item::strip_system_fields(&corrected, true);
            item::set_id(&mut kept, op.item_id.clone());
            inner.store.upsert(&op.table, &[kept])?;
        }
        None => inner.store.delete(&op.table, &[op.item_id.clone()])?,
    }
    inner.queue.remove(op.id)?;
    info!(table = %op.table, item_id = %op.item_id, op_id = op.id, "operation cancelled");
    Ok(())
}
