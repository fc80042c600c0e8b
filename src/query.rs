//! Structured queries shared by the local store, the pull runner and
//! the remote seam.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::item::Item;

/// Query parameter the engine forces onto every pull so tombstones
/// reach the client.
pub const INCLUDE_DELETED_PARAM: &str = "__includeDeleted";
/// Reserved wire parameter; user parameter maps must not carry it.
pub const SYSTEM_PROPERTIES_PARAM: &str = "__systemProperties";

static QUERY_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]{0,24}$").unwrap());

/// Validate an optional incremental-pull stream name. `None` is always
/// permitted.
pub fn validate_query_id(query_id: Option<&str>) -> Result<(), Error> {
    match query_id {
        None => Ok(()),
        Some(raw) if QUERY_ID.is_match(raw) => Ok(()),
        Some(raw) => Err(Error::InvalidQueryId(raw.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDir {
    Ascending,
    Descending,
}

/// Minimal predicate over item fields, evaluated in-process by the
/// local store (and by test servers). How a predicate is rendered on
/// the wire is the remote client's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Le(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn matches(&self, item: &Item) -> bool {
        match self {
            Filter::Eq(field, value) => item.get(field) == Some(value),
            Filter::Ne(field, value) => item.get(field) != Some(value),
            Filter::Lt(field, value) => cmp_field(item, field, value) == Some(Ordering::Less),
            Filter::Le(field, value) => {
                matches!(cmp_field(item, field, value), Some(Ordering::Less | Ordering::Equal))
            }
            Filter::Gt(field, value) => cmp_field(item, field, value) == Some(Ordering::Greater),
            Filter::Ge(field, value) => {
                matches!(cmp_field(item, field, value), Some(Ordering::Greater | Ordering::Equal))
            }
            Filter::And(parts) => parts.iter().all(|part| part.matches(item)),
            Filter::Or(parts) => parts.iter().any(|part| part.matches(item)),
            Filter::Not(inner) => !inner.matches(item),
        }
    }
}

fn cmp_field(item: &Item, field: &str, value: &Value) -> Option<Ordering> {
    cmp_values(item.get(field)?, value)
}

/// Order two JSON scalars of the same shape. RFC 3339 UTC timestamps
/// order correctly as strings, which is what the delta-token predicate
/// relies on.
fn cmp_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// A read against one named table, local or remote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub table: String,
    pub filter: Option<Filter>,
    pub order: Vec<(String, SortDir)>,
    /// Fetch offset into the (filtered, ordered) result.
    pub skip: u64,
    /// Page size; `None` reads everything.
    pub top: Option<u64>,
    pub select_fields: Vec<String>,
    pub include_total_count: bool,
    /// Extra wire parameters passed through to the server.
    pub parameters: BTreeMap<String, String>,
}

impl Query {
    pub fn table(name: impl Into<String>) -> Self {
        Query {
            table: name.into(),
            filter: None,
            order: Vec::new(),
            skip: 0,
            top: None,
            select_fields: Vec::new(),
            include_total_count: false,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_order(mut self, field: impl Into<String>, dir: SortDir) -> Self {
        self.order.push((field.into(), dir));
        self
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_top(mut self, top: u64) -> Self {
        self.top = Some(top);
        self
    }
}

/// Evaluate `query` against an in-memory row set: filter, order, then
/// page. Returns the page and the filtered total.
pub fn run_query(rows: impl IntoIterator<Item = Item>, query: &Query) -> (Vec<Item>, u64) {
    let mut matched: Vec<Item> = rows
        .into_iter()
        .filter(|row| query.filter.as_ref().is_none_or(|f| f.matches(row)))
        .collect();
    let total = matched.len() as u64;

    if !query.order.is_empty() {
        matched.sort_by(|a, b| {
            for (field, dir) in &query.order {
                let ordering = match (a.get(field), b.get(field)) {
                    (Some(va), Some(vb)) => cmp_values(va, vb).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                };
                let ordering = match dir {
                    SortDir::Ascending => ordering,
                    SortDir::Descending => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    let skipped = matched.into_iter().skip(query.skip as usize);
    let page = match query.top {
        Some(top) => skipped.take(top as usize).collect(),
        None => skipped.collect(),
    };
    (page, total)
}
