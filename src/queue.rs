//! Durable, ordered collection of pending operations, backed by the
//! data source's operation table and indexed by (table, item-id).

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::item::Item;
use crate::op::{OpKind, OpState, Operation};
use crate::query::{Filter, Query};
use crate::store::{DataSource, StoreError};

pub struct OperationQueue {
    store: Arc<dyn DataSource>,
    next_id: AtomicI64,
}

impl OperationQueue {
    /// Bind to the store and seed the id counter with
    /// max(existing id) + 1, so ids stay strictly increasing across
    /// process restarts.
    pub fn open(store: Arc<dyn DataSource>) -> Result<OperationQueue> {
        let ops = read_all_ops(store.as_ref())?;
        let max_id = ops.iter().map(|op| op.id).max().unwrap_or(0);
        debug!(pending = ops.len(), next_id = max_id + 1, "operation queue opened");
        Ok(OperationQueue { store, next_id: AtomicI64::new(max_id + 1) })
    }

    pub fn next_operation_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Every queued operation, in operation-id order.
    pub fn all(&self) -> Result<Vec<Operation>> {
        read_all_ops(self.store.as_ref())
    }

    /// Queued operations for one table, in operation-id order.
    pub fn ops_for_table(&self, table: &str) -> Result<Vec<Operation>> {
        let query = Query::table(self.store.operation_table_name())
            .with_filter(Filter::Eq("tableName".into(), Value::String(table.to_string())));
        let rows = self.store.read_by_query(&query)?;
        ops_from_rows(rows.items)
    }

    /// The at-most-one queued operation for (table, item-id).
    pub fn op_for_item(&self, table: &str, item_id: &str) -> Result<Option<Operation>> {
        let query = Query::table(self.store.operation_table_name()).with_filter(Filter::And(vec![
            Filter::Eq("tableName".into(), Value::String(table.to_string())),
            Filter::Eq("itemId".into(), Value::String(item_id.to_string())),
        ]));
        let rows = self.store.read_by_query(&query)?;
        Ok(ops_from_rows(rows.items)?.into_iter().next())
    }

    pub fn add(&self, op: &Operation) -> Result<()> {
        if self.op_for_item(&op.table, &op.item_id)?.is_some() {
            return Err(Error::QueueConflict {
                table: op.table.clone(),
                item_id: op.item_id.clone(),
            });
        }
        self.write(op)
    }

    /// Rewrite the stored form after condensation or an error update.
    pub fn update(&self, op: &Operation) -> Result<()> {
        self.write(op)
    }

    /// Remove by operation id; a no-op when the id is already gone.
    /// Any error state recorded on the operation goes with it.
    pub fn remove(&self, operation_id: i64) -> Result<()> {
        let table = self.store.operation_table_name().to_string();
        self.store.delete(&table, &[operation_id.to_string()])?;
        Ok(())
    }

    pub fn count(&self) -> Result<u64> {
        let mut query = Query::table(self.store.operation_table_name());
        query.include_total_count = true;
        query.top = Some(0);
        let rows = self.store.read_by_query(&query)?;
        Ok(rows.total_count.unwrap_or(0))
    }

    fn write(&self, op: &Operation) -> Result<()> {
        let table = self.store.operation_table_name().to_string();
        self.store.upsert(&table, &[op_to_row(op)])?;
        Ok(())
    }
}

fn read_all_ops(store: &dyn DataSource) -> Result<Vec<Operation>> {
    let rows = store.read_by_query(&Query::table(store.operation_table_name()))?;
    ops_from_rows(rows.items)
}

fn ops_from_rows(rows: Vec<Item>) -> Result<Vec<Operation>> {
    let mut ops = rows.iter().map(op_from_row).collect::<Result<Vec<_>>>()?;
    ops.sort_by_key(|op| op.id);
    Ok(ops)
}

fn op_to_row(op: &Operation) -> Item {
    let mut row = Item::new();
    row.insert("id".into(), Value::String(op.id.to_string()));
    row.insert("tableName".into(), Value::String(op.table.clone()));
    row.insert("itemId".into(), Value::String(op.item_id.clone()));
    row.insert("type".into(), Value::String(op.kind.as_str().to_string()));
    row.insert(
        "item".into(),
        op.item.clone().map_or(Value::Null, Value::Object),
    );
    row.insert("version".into(), Value::from(op.version));
    match &op.state {
        OpState::Pending => {
            row.insert("state".into(), Value::String("pending".into()));
        }
        OpState::Errored { message, server_item } => {
            row.insert("state".into(), Value::String("errored".into()));
            row.insert("error".into(), Value::String(message.clone()));
            row.insert(
                "serverItem".into(),
                server_item.clone().map_or(Value::Null, Value::Object),
            );
        }
    }
    row
}

fn invalid_row() -> Error {
    Error::Store(StoreError::InvalidRow("malformed operation row"))
}

fn text_field<'a>(row: &'a Item, name: &str) -> Result<&'a str> {
    row.get(name).and_then(Value::as_str).ok_or_else(invalid_row)
}

fn op_from_row(row: &Item) -> Result<Operation> {
    let id = text_field(row, "id")?.parse::<i64>().map_err(|_| invalid_row())?;
    let kind = OpKind::parse(text_field(row, "type")?).ok_or_else(invalid_row)?;
    let item = match row.get("item") {
        Some(Value::Object(map)) => Some(map.clone()),
        _ => None,
    };
    let version = row
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(invalid_row)? as u32;
    let state = match text_field(row, "state")? {
        "pending" => OpState::Pending,
        "errored" => OpState::Errored {
            message: row
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            server_item: match row.get("serverItem") {
                Some(Value::Object(map)) => Some(map.clone()),
                _ => None,
            },
        },
        _ => return Err(invalid_row()),
    };

    Ok(Operation {
        id,
        table: text_field(row, "tableName")?.to_string(),
        item_id: text_field(row, "itemId")?.to_string(),
        kind,
        item,
        version,
        state,
    })
}
