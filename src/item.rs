//! Items and the server-managed system fields carried on them.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::Error;

/// Opaque field-name to JSON value mapping handled by the engine.
/// Every item the engine accepts carries a string `id`.
pub type Item = Map<String, Value>;

pub const ID_FIELD: &str = "id";
pub const VERSION_FIELD: &str = "__version";
pub const UPDATED_AT_FIELD: &str = "__updatedAt";
pub const DELETED_FIELD: &str = "__deleted";
pub const CREATED_AT_FIELD: &str = "__createdAt";

pub fn id(item: &Item) -> Option<&str> {
    item.get(ID_FIELD).and_then(Value::as_str)
}

pub fn require_id(item: &Item) -> Result<&str, Error> {
    id(item).ok_or(Error::InvalidParameter("item is missing a string `id`"))
}

pub fn set_id(item: &mut Item, value: String) {
    item.insert(ID_FIELD.to_string(), Value::String(value));
}

pub fn version(item: &Item) -> Option<&str> {
    item.get(VERSION_FIELD).and_then(Value::as_str)
}

pub fn is_deleted(item: &Item) -> bool {
    item.get(DELETED_FIELD).and_then(Value::as_bool).unwrap_or(false)
}

/// Parse the server `__updatedAt` stamp. Returns `None` when the field
/// is absent or not a valid RFC 3339 timestamp.
pub fn updated_at(item: &Item) -> Option<DateTime<Utc>> {
    parse_timestamp(item.get(UPDATED_AT_FIELD)?.as_str()?)
}

/// Copy of `item` without server-managed fields. Any `__`-prefixed
/// field is dropped; `__version` survives when `keep_version` is set
/// so optimistic concurrency still works on the next push.
pub fn strip_system_fields(item: &Item, keep_version: bool) -> Item {
    item.iter()
        .filter(|(key, _)| !key.starts_with("__") || (keep_version && key.as_str() == VERSION_FIELD))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// RFC 3339 UTC with millisecond precision, the engine's only
/// timestamp wire format (no locale).
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}
