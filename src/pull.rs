//! Paged server reads merged into the local store, with optional
//! delta-token incrementality, plus purge.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config;
use crate::context::ContextInner;
use crate::error::{Error, Result};
use crate::item::{self, Item};
use crate::push;
use crate::query::{self, Filter, INCLUDE_DELETED_PARAM, Query, SYSTEM_PROPERTIES_PARAM, SortDir};

fn upgrade(weak: &Weak<ContextInner>) -> Result<Arc<ContextInner>> {
    match weak.upgrade() {
        Some(inner) if !inner.is_cancelled() => Ok(inner),
        _ => Err(Error::PullCancelled),
    }
}

/// Sync-lane body of a pull.
pub(crate) fn run(weak: &Weak<ContextInner>, query: Query, query_id: Option<&str>) -> Result<u64> {
    validate(&query, query_id)?;
    let query = {
        let inner = upgrade(weak)?;
        normalize(inner.as_ref(), query, query_id)?
    };

    // A dirty table pushes first; condensed writes can appear while a
    // push is in flight, so re-check until the table is clean.
    loop {
        let inner = upgrade(weak)?;
        let pending = inner.queue.ops_for_table(&query.table)?;
        if pending.is_empty() {
            break;
        }
        info!(table = %query.table, pending = pending.len(), "pull deferring to push");
        drop(inner);
        push::run(weak)?;
    }

    let incremental = query_id.is_some();
    let mut token: Option<DateTime<Utc>> = None;
    if let Some(qid) = query_id {
        let inner = upgrade(weak)?;
        let stored = config::load_delta_token(inner.store.as_ref(), &query.table, qid)?;
        token = Some(stored.unwrap_or(DateTime::<Utc>::UNIX_EPOCH));
        debug!(table = %query.table, query_id = qid, token = ?stored, "incremental pull");
    }

    // The first probe excludes rows stamped exactly at the token: they
    // were already ingested when the token was persisted. Rebuilds
    // after a token advance are inclusive so equal-timestamp rows
    // split across pages are not lost.
    let mut inclusive_bound = false;
    let mut offset = query.skip;
    let mut processed: u64 = 0;

    loop {
        let inner = upgrade(weak)?;
        let page_query = build_server_query(&query, token, inclusive_bound, offset, inner.page_size);
        let remote = Arc::clone(&inner.remote);
        drop(inner);

        let page = remote
            .query(&page_query)
            .map_err(|err| Error::PullAborted(Box::new(Error::Remote(err))))?;
        if page.items.is_empty() {
            break;
        }
        let page_len = page.items.len() as u64;
        let max_updated = if incremental { page_max_updated_at(&page.items) } else { None };
        let advance = match (token, max_updated) {
            (Some(current), Some(max)) if max > current => Some(max),
            _ => None,
        };

        let inner = upgrade(weak)?;
        let merge_inner = Arc::clone(&inner);
        let table = query.table.clone();
        let items = page.items;
        let token_advance = query_id.map(str::to_string).zip(advance);
        processed += inner
            .writer
            .run_sync(move || merge_page(&merge_inner, &table, items, token_advance))
            .ok_or(Error::PullCancelled)??;

        match advance {
            Some(max) => {
                token = Some(max);
                inclusive_bound = true;
                offset = 0;
            }
            None => offset += page_len,
        }
    }

    info!(table = %query.table, processed, "pull complete");
    Ok(processed)
}

fn validate(query: &Query, query_id: Option<&str>) -> Result<()> {
    query::validate_query_id(query_id)?;
    if !query.select_fields.is_empty() {
        return Err(Error::InvalidParameter("pull queries cannot select fields"));
    }
    if query.include_total_count {
        return Err(Error::InvalidParameter("pull queries cannot request a total count"));
    }
    if query_id.is_some() && (!query.order.is_empty() || query.skip != 0) {
        return Err(Error::InvalidParameter(
            "incremental pulls control ordering and fetch offset themselves",
        ));
    }
    for key in query.parameters.keys() {
        if key.eq_ignore_ascii_case(SYSTEM_PROPERTIES_PARAM) {
            return Err(Error::InvalidParameter("__systemProperties cannot be supplied by callers"));
        }
    }
    if let Some(value) = query.parameters.get(INCLUDE_DELETED_PARAM)
        && !value.eq_ignore_ascii_case("true")
    {
        return Err(Error::InvalidParameter("__includeDeleted cannot be disabled for a pull"));
    }
    Ok(())
}

fn normalize(inner: &ContextInner, mut query: Query, query_id: Option<&str>) -> Result<Query> {
    // Tombstones must reach the client.
    query
        .parameters
        .insert(INCLUDE_DELETED_PARAM.to_string(), "true".to_string());
    let props = inner.store.system_properties(&query.table);
    if !props.deleted {
        return Err(Error::InvalidParameter("data source does not retain __deleted for this table"));
    }
    if query_id.is_some() && !props.updated_at {
        return Err(Error::InvalidParameter("data source does not retain __updatedAt for this table"));
    }
    Ok(query)
}

fn build_server_query(
    base: &Query,
    token: Option<DateTime<Utc>>,
    inclusive: bool,
    skip: u64,
    page_size: u32,
) -> Query {
    let mut server = Query::table(base.table.clone());
    server.parameters = base.parameters.clone();
    server.skip = skip;
    server.top = Some(page_size as u64);
    match token {
        Some(token) => {
            let stamp = Value::String(item::format_timestamp(token));
            let bound = if inclusive {
                Filter::Ge(item::UPDATED_AT_FIELD.to_string(), stamp)
            } else {
                Filter::Gt(item::UPDATED_AT_FIELD.to_string(), stamp)
            };
            server.filter = Some(match base.filter.clone() {
                Some(user) => Filter::And(vec![user, bound]),
                None => bound,
            });
            server.order = vec![(item::UPDATED_AT_FIELD.to_string(), SortDir::Ascending)];
        }
        None => {
            server.filter = base.filter.clone();
            server.order = base.order.clone();
        }
    }
    server
}

fn page_max_updated_at(items: &[Item]) -> Option<DateTime<Utc>> {
    items
        .iter()
        .map(|row| {
            item::updated_at(row).unwrap_or_else(|| {
                warn!(
                    item_id = item::id(row).unwrap_or("?"),
                    "server row has no usable __updatedAt; treated as epoch"
                );
                DateTime::<Utc>::UNIX_EPOCH
            })
        })
        .max()
}

/// Writer-domain merge of one server page: rows shadowed by a pending
/// operation are dropped, tombstones delete, the rest upsert, and an
/// advanced delta token is persisted in the same turn.
fn merge_page(
    inner: &ContextInner,
    table: &str,
    items: Vec<Item>,
    token_advance: Option<(String, DateTime<Utc>)>,
) -> Result<u64> {
    let mut deletes: Vec<String> = Vec::new();
    let mut upserts: Vec<Item> = Vec::new();
    for row in items {
        let Some(id) = item::id(&row).map(str::to_string) else {
            warn!(table, "server row without id skipped");
            continue;
        };
        if inner.queue.op_for_item(table, &id)?.is_some() {
            debug!(table, item_id = %id, "pending operation shadows server row");
            continue;
        }
        if item::is_deleted(&row) {
            deletes.push(id);
        } else {
            upserts.push(row);
        }
    }
    let merged = (deletes.len() + upserts.len()) as u64;
    if !deletes.is_empty() {
        inner.store.delete(table, &deletes)?;
    }
    if !upserts.is_empty() {
        inner.store.upsert(table, &upserts)?;
    }
    if let Some((query_id, token)) = token_advance {
        config::save_delta_token(inner.store.as_ref(), table, &query_id, token)?;
    }
    Ok(merged)
}

/// Writer-domain body of a purge.
pub(crate) fn run_purge(inner: &ContextInner, query: &Query, query_id: Option<&str>, force: bool) -> Result<()> {
    query::validate_query_id(query_id)?;
    if let Some(qid) = query_id {
        config::delete_delta_token(inner.store.as_ref(), &query.table, qid)?;
    }
    let pending = inner.queue.ops_for_table(&query.table)?;
    if !pending.is_empty() {
        if query.filter.is_some() || !force {
            return Err(Error::PurgeAborted);
        }
        info!(table = %query.table, discarded = pending.len(), "forced purge discarding pending operations");
        for op in pending {
            inner.queue.remove(op.id)?;
        }
    }
    inner.store.delete_by_query(query)?;
    info!(table = %query.table, "purge complete");
    Ok(())
}
