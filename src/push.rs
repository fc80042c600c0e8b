//! Drains the operation queue to the remote, one operation at a time,
//! in enqueue order.

use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use crate::context::ContextInner;
use crate::error::{Error, OperationError, Result};
use crate::item::{self, Item};
use crate::op::{OpKind, OpState, Operation};
use crate::remote::{RemoteClient, RemoteError};

/// User hook replacing the default remote call for an operation, e.g.
/// to resolve conflicts or target custom endpoints. `Ok(None)` means
/// the operation produced no server item (the delete case).
pub trait PushHandler: Send + Sync {
    fn execute(
        &self,
        op: &Operation,
        item: Option<&Item>,
        remote: &dyn RemoteClient,
    ) -> std::result::Result<Option<Item>, RemoteError>;
}

fn upgrade(weak: &Weak<ContextInner>) -> Result<Arc<ContextInner>> {
    match weak.upgrade() {
        Some(inner) if !inner.is_cancelled() => Ok(inner),
        _ => Err(Error::PushCancelled),
    }
}

/// Sync-lane body of a push. Per-op failures are collected; transport
/// and authorization failures abort the whole drain.
pub(crate) fn run(weak: &Weak<ContextInner>) -> Result<()> {
    let inner = upgrade(weak)?;
    // Snapshot through the writer domain so the drain starts from a
    // state no in-flight mutation can straddle.
    let snap_inner = Arc::clone(&inner);
    let snapshot = inner
        .writer
        .run_sync(move || snap_inner.queue.all())
        .ok_or(Error::PushCancelled)??;
    info!(ops = snapshot.len(), "push starting");
    drop(inner);

    let mut op_errors: Vec<OperationError> = Vec::new();
    for op in snapshot {
        let inner = upgrade(weak)?;
        // Current local item for inserts and updates; the captured
        // snapshot for deletes.
        let payload = match op.kind {
            OpKind::Delete => op.item.clone(),
            OpKind::Insert | OpKind::Update => inner.store.read(&op.table, &op.item_id)?,
        };
        if payload.is_none() && op.kind != OpKind::Delete {
            // The local row vanished underneath the operation; surface
            // it as a per-op error rather than pushing nothing.
            record_op_error(&inner, &op, "local item is missing", None, &mut op_errors)?;
            continue;
        }

        let remote = Arc::clone(&inner.remote);
        let handler = inner.push_handler.clone();
        let version_at_send = op.version;
        drop(inner);

        let outcome = execute(handler.as_deref(), remote.as_ref(), &op, payload.as_ref());

        let inner = upgrade(weak)?;
        match outcome {
            Ok(server_item) => {
                let finish_inner = Arc::clone(&inner);
                let finish_op = op.clone();
                inner
                    .writer
                    .run_sync(move || finish_success(&finish_inner, &finish_op, version_at_send, server_item))
                    .ok_or(Error::PushCancelled)??;
                debug!(op_id = op.id, table = %op.table, item_id = %op.item_id, "pushed");
            }
            Err(err) if err.aborts_push() => {
                warn!(op_id = op.id, error = %err, "push aborted");
                return Err(Error::PushAborted { cause: Some(err), op_errors });
            }
            Err(err) => {
                let server_item = err.server_item().cloned();
                record_op_error(&inner, &op, &err.to_string(), server_item, &mut op_errors)?;
            }
        }
    }

    if op_errors.is_empty() {
        info!("push complete");
        Ok(())
    } else {
        Err(Error::PushAborted { cause: None, op_errors })
    }
}

fn execute(
    handler: Option<&dyn PushHandler>,
    remote: &dyn RemoteClient,
    op: &Operation,
    payload: Option<&Item>,
) -> std::result::Result<Option<Item>, RemoteError> {
    if let Some(handler) = handler {
        return handler.execute(op, payload, remote);
    }
    match (op.kind, payload) {
        (OpKind::Insert, Some(current)) => remote.insert(&op.table, current).map(Some),
        (OpKind::Update, Some(current)) => remote.update(&op.table, current).map(Some),
        (OpKind::Delete, snapshot) => {
            let version = snapshot.and_then(item::version);
            remote.delete(&op.table, &op.item_id, version).map(|()| None)
        }
        // Insert/update payloads are checked by the caller.
        (_, None) => Err(RemoteError::Validation {
            status: 0,
            message: "missing local item".into(),
        }),
    }
}

/// Writer-domain tail of a successful remote call: the operation is
/// removed and the server copy persisted only when no newer pending
/// mutation raced the request.
fn finish_success(
    inner: &ContextInner,
    op: &Operation,
    version_at_send: u32,
    server_item: Option<Item>,
) -> Result<()> {
    match inner.queue.op_for_item(&op.table, &op.item_id)? {
        Some(current) if current.id == op.id && current.version == version_at_send => {
            inner.queue.remove(op.id)?;
            if let Some(server_item) = server_item {
                inner.store.upsert(&op.table, &[server_item])?;
            }
            Ok(())
        }
        _ => {
            debug!(op_id = op.id, "operation changed during push; kept for the next drain");
            Ok(())
        }
    }
}

fn record_op_error(
    inner: &Arc<ContextInner>,
    op: &Operation,
    message: &str,
    server_item: Option<Item>,
    collected: &mut Vec<OperationError>,
) -> Result<()> {
    warn!(op_id = op.id, table = %op.table, item_id = %op.item_id, message, "operation failed; continuing");
    collected.push(OperationError {
        operation_id: op.id,
        table: op.table.clone(),
        item_id: op.item_id.clone(),
        op_kind: op.kind,
        message: message.to_string(),
        server_item: server_item.clone(),
    });

    let writer_inner = Arc::clone(inner);
    let mut errored = op.clone();
    errored.state = OpState::Errored {
        message: message.to_string(),
        server_item,
    };
    inner
        .writer
        .run_sync(move || {
            // Only mark the stored op when it is still the one pushed.
            match writer_inner.queue.op_for_item(&errored.table, &errored.item_id)? {
                Some(current) if current.id == errored.id && current.version == errored.version => {
                    writer_inner.queue.update(&errored)
                }
                _ => Ok(()),
            }
        })
        .ok_or(Error::PushCancelled)??;
    Ok(())
}
