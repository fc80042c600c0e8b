//! Thin per-table facade over the sync context.

use crate::context::{Completion, SyncContext};
use crate::error::{Error, Result};
use crate::item::Item;
use crate::op::OpKind;
use crate::query::{Filter, Query};
use crate::store::QueryResult;

/// A named table bound to a [`SyncContext`]. Reads go straight to the
/// local store; writes are queued for the next push.
pub struct SyncTable {
    ctx: SyncContext,
    name: String,
}

impl SyncTable {
    pub(crate) fn new(ctx: SyncContext, name: String) -> SyncTable {
        SyncTable { ctx, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue an insert. When the item has no `id`, one is generated
    /// and the completion receives the item carrying it.
    pub fn insert(&self, item: Item, completion: Completion<Item>) {
        self.ctx.apply_local_mutation(self.name.clone(), item, OpKind::Insert, completion);
    }

    pub fn update(&self, item: Item, completion: Completion<Item>) {
        self.ctx.apply_local_mutation(self.name.clone(), item, OpKind::Update, completion);
    }

    pub fn delete(&self, item: Item, completion: Completion<Item>) {
        self.ctx.apply_local_mutation(self.name.clone(), item, OpKind::Delete, completion);
    }

    pub fn read_with_id(&self, item_id: &str) -> Result<Option<Item>> {
        Ok(self.ctx.data_source().read(&self.name, item_id)?)
    }

    pub fn read_with_filter(&self, filter: Filter) -> Result<Vec<Item>> {
        let query = Query::table(&self.name).with_filter(filter);
        Ok(self.ctx.data_source().read_by_query(&query)?.items)
    }

    pub fn read_all(&self) -> Result<Vec<Item>> {
        Ok(self.ctx.data_source().read_by_query(&Query::table(&self.name))?.items)
    }

    /// Local read with full query shape (ordering, paging, count).
    pub fn read_with_query(&self, query: &Query) -> Result<QueryResult> {
        if query.table != self.name {
            return Err(Error::InvalidParameter("query targets a different table"));
        }
        Ok(self.ctx.data_source().read_by_query(query)?)
    }

    /// Pull server rows into the local store. With a `query_id` the
    /// pull is incremental over that named stream.
    pub fn pull(&self, query: Query, query_id: Option<&str>, completion: Completion<u64>) {
        if query.table != self.name {
            return self
                .ctx
                .finish(completion, Err(Error::InvalidParameter("query targets a different table")));
        }
        self.ctx.schedule_pull(query, query_id.map(str::to_string), completion);
    }

    /// Drop local rows. `None` purges the whole table. A purge with a
    /// predicate, or without `force`, refuses while the table has
    /// pending operations.
    pub fn purge(&self, query: Option<Query>, query_id: Option<&str>, force: bool, completion: Completion<()>) {
        let query = query.unwrap_or_else(|| Query::table(&self.name));
        if query.table != self.name {
            return self
                .ctx
                .finish(completion, Err(Error::InvalidParameter("query targets a different table")));
        }
        self.ctx.schedule_purge(query, query_id.map(str::to_string), force, completion);
    }
}
