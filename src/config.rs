//! Typed rows in the data source's config table. The only kind the
//! engine writes today is the per-(table, query-id) delta token.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::item::{self, Item};
use crate::store::{DataSource, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    /// Server `__updatedAt` high-water mark already ingested by an
    /// incremental pull stream.
    DeltaToken,
}

impl ConfigKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigKind::DeltaToken => "deltaToken",
        }
    }

    pub fn parse(raw: &str) -> Option<ConfigKind> {
        match raw {
            "deltaToken" => Some(ConfigKind::DeltaToken),
            _ => None,
        }
    }
}

/// One config-table row.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigValue {
    pub table: String,
    pub kind: ConfigKind,
    pub key: String,
    pub value: String,
}

impl ConfigValue {
    pub fn delta_token(table: impl Into<String>, query_id: impl Into<String>, token: DateTime<Utc>) -> ConfigValue {
        ConfigValue {
            table: table.into(),
            kind: ConfigKind::DeltaToken,
            key: query_id.into(),
            value: item::format_timestamp(token),
        }
    }

    /// Stable composite row id, e.g. `deltaToken|todo|q1`.
    pub fn id(&self) -> String {
        format!("{}|{}|{}", self.kind.as_str(), self.table, self.key)
    }

    pub fn to_item(&self) -> Item {
        let mut row = Item::new();
        row.insert("id".into(), Value::String(self.id()));
        row.insert("table".into(), Value::String(self.table.clone()));
        row.insert("kind".into(), Value::String(self.kind.as_str().to_string()));
        row.insert("key".into(), Value::String(self.key.clone()));
        row.insert("value".into(), Value::String(self.value.clone()));
        row
    }

    pub fn from_item(row: &Item) -> Result<ConfigValue> {
        let kind = ConfigKind::parse(config_field(row, "kind")?)
            .ok_or(Error::Store(StoreError::InvalidRow("unknown config kind")))?;
        Ok(ConfigValue {
            table: config_field(row, "table")?.to_string(),
            kind,
            key: config_field(row, "key")?.to_string(),
            value: config_field(row, "value")?.to_string(),
        })
    }
}

fn config_field<'a>(row: &'a Item, name: &str) -> Result<&'a str> {
    row.get(name)
        .and_then(Value::as_str)
        .ok_or(Error::Store(StoreError::InvalidRow("config row is missing a field")))
}

fn delta_token_row_id(table: &str, query_id: &str) -> String {
    format!("{}|{}|{}", ConfigKind::DeltaToken.as_str(), table, query_id)
}

pub fn load_delta_token(
    store: &dyn DataSource,
    table: &str,
    query_id: &str,
) -> Result<Option<DateTime<Utc>>> {
    let config_table = store.config_table_name().to_string();
    let row = store.read(&config_table, &delta_token_row_id(table, query_id))?;
    let Some(row) = row else { return Ok(None) };
    let value = ConfigValue::from_item(&row)?;
    item::parse_timestamp(&value.value)
        .map(Some)
        .ok_or(Error::Store(StoreError::InvalidRow("delta token is not a timestamp")))
}

/// Persist `token` for the stream, keeping the stored value
/// monotonically non-decreasing.
pub fn save_delta_token(
    store: &dyn DataSource,
    table: &str,
    query_id: &str,
    token: DateTime<Utc>,
) -> Result<()> {
    if let Some(current) = load_delta_token(store, table, query_id)?
        && current >= token
    {
        return Ok(());
    }
    let config_table = store.config_table_name().to_string();
    let row = ConfigValue::delta_token(table, query_id, token).to_item();
    store.upsert(&config_table, &[row])?;
    debug!(table, query_id, token = %item::format_timestamp(token), "delta token advanced");
    Ok(())
}

pub fn delete_delta_token(store: &dyn DataSource, table: &str, query_id: &str) -> Result<()> {
    let config_table = store.config_table_name().to_string();
    store.delete(&config_table, &[delta_token_row_id(table, query_id)])?;
    Ok(())
}
