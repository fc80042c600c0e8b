//! Local persistence seam and the bundled SQLite data source.

use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::item::{self, Item};
use crate::query::{Query, run_query};

/// Reserved table holding pending operations.
pub const OPERATION_TABLE: &str = "__operations";
/// Reserved table holding per-(table, key) configuration rows such as
/// delta tokens.
pub const CONFIG_TABLE: &str = "__config";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid row: {0}")]
    InvalidRow(&'static str),
    #[error("store unavailable: {0}")]
    Unavailable(&'static str),
}

/// Which server-managed fields a data source retains for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemProperties {
    pub version: bool,
    pub updated_at: bool,
    pub deleted: bool,
    pub created_at: bool,
}

impl SystemProperties {
    pub const VERSION_ONLY: SystemProperties = SystemProperties {
        version: true,
        updated_at: false,
        deleted: false,
        created_at: false,
    };

    pub const ALL: SystemProperties = SystemProperties {
        version: true,
        updated_at: true,
        deleted: true,
        created_at: true,
    };
}

#[derive(Debug, Default)]
pub struct QueryResult {
    pub items: Vec<Item>,
    /// Filtered total, populated when the query asked for it.
    pub total_count: Option<u64>,
}

/// Persistent key-value store the engine reads and writes local data
/// through. Mutations are always issued from the writer domain; reads
/// may come from any thread and see a consistent snapshot per call.
pub trait DataSource: Send + Sync {
    fn upsert(&self, table: &str, items: &[Item]) -> Result<(), StoreError>;
    fn delete(&self, table: &str, item_ids: &[String]) -> Result<(), StoreError>;
    fn delete_by_query(&self, query: &Query) -> Result<(), StoreError>;
    fn read(&self, table: &str, item_id: &str) -> Result<Option<Item>, StoreError>;
    fn read_by_query(&self, query: &Query) -> Result<QueryResult, StoreError>;

    fn system_properties(&self, table: &str) -> SystemProperties {
        let _ = table;
        SystemProperties::VERSION_ONLY
    }

    fn operation_table_name(&self) -> &str {
        OPERATION_TABLE
    }

    fn config_table_name(&self) -> &str {
        CONFIG_TABLE
    }
}

/// SQLite-backed data source. All logical tables share one physical
/// table keyed by (table_name, item_id); bodies are stored as JSON and
/// system fields are preserved verbatim.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Bind the store to an existing SQLite connection and create the
    /// required schema. Safe to call on an already-initialized file.
    pub fn new(conn: Connection) -> Result<Self, StoreError> {
        let store = SqliteStore { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open(path: &str) -> Result<Self, StoreError> {
        SqliteStore::new(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        SqliteStore::new(Connection::open_in_memory()?)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
PRAGMA journal_mode=WAL;

CREATE TABLE IF NOT EXISTS sync_items (
table_name TEXT NOT NULL,
item_id TEXT NOT NULL,
body TEXT NOT NULL,
PRIMARY KEY (table_name, item_id)
);

CREATE INDEX IF NOT EXISTS idx_sync_items_table
ON sync_items(table_name);

CREATE TABLE IF NOT EXISTS sync_meta (
k TEXT PRIMARY KEY,
v TEXT NOT NULL
);
"#,
        )?;
        conn.execute(
            "INSERT INTO sync_meta(k,v) VALUES('schema_version','1')
ON CONFLICT(k) DO NOTHING",
            [],
        )?;
        Ok(())
    }

    /// Current integer schema version stored in `sync_meta`.
    pub fn schema_version(&self) -> Result<i32, StoreError> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row("SELECT v FROM sync_meta WHERE k='schema_version'", [], |r| r.get(0))
            .optional()?;
        Ok(raw.and_then(|s| s.parse::<i32>().ok()).unwrap_or(1))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned"))
    }

    fn read_table(conn: &Connection, table: &str) -> Result<Vec<Item>, StoreError> {
        let mut stmt = conn.prepare("SELECT body FROM sync_items WHERE table_name=?1")?;
        let rows = stmt.query_map(params![table], |r| r.get::<_, String>(0))?;
        let mut items = Vec::new();
        for body in rows {
            items.push(parse_body(&body?)?);
        }
        Ok(items)
    }
}

fn parse_body(raw: &str) -> Result<Item, StoreError> {
    match serde_json::from_str::<serde_json::Value>(raw)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(StoreError::InvalidRow("body is not a JSON object")),
    }
}

impl DataSource for SqliteStore {
    fn upsert(&self, table: &str, items: &[Item]) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        for it in items {
            let id = item::id(it).ok_or(StoreError::InvalidRow("item is missing a string `id`"))?;
            tx.execute(
                "INSERT INTO sync_items(table_name,item_id,body) VALUES(?1,?2,?3)
ON CONFLICT(table_name,item_id) DO UPDATE SET body=excluded.body",
                params![table, id, serde_json::Value::Object(it.clone()).to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, table: &str, item_ids: &[String]) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        for id in item_ids {
            tx.execute(
                "DELETE FROM sync_items WHERE table_name=?1 AND item_id=?2",
                params![table, id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_by_query(&self, query: &Query) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let Some(filter) = &query.filter else {
            conn.execute("DELETE FROM sync_items WHERE table_name=?1", params![&query.table])?;
            return Ok(());
        };
        let rows = Self::read_table(&conn, &query.table)?;
        let tx = conn.unchecked_transaction()?;
        for row in rows.iter().filter(|row| filter.matches(row)) {
            if let Some(id) = item::id(row) {
                tx.execute(
                    "DELETE FROM sync_items WHERE table_name=?1 AND item_id=?2",
                    params![&query.table, id],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn read(&self, table: &str, item_id: &str) -> Result<Option<Item>, StoreError> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM sync_items WHERE table_name=?1 AND item_id=?2",
                params![table, item_id],
                |r| r.get(0),
            )
            .optional()?;
        body.as_deref().map(parse_body).transpose()
    }

    fn read_by_query(&self, query: &Query) -> Result<QueryResult, StoreError> {
        let rows = {
            let conn = self.lock()?;
            Self::read_table(&conn, &query.table)?
        };
        let (items, total) = run_query(rows, query);
        Ok(QueryResult {
            items,
            total_count: query.include_total_count.then_some(total),
        })
    }

    fn system_properties(&self, _table: &str) -> SystemProperties {
        // Bodies are stored verbatim, so every system field survives.
        SystemProperties::ALL
    }
}
