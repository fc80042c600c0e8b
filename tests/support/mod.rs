//! Shared fixtures: an in-process fake server and completion helpers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::{Value, json};

use offsync::query::run_query;
use offsync::{
    Completion, Item, Page, Query, RemoteClient, RemoteError, Settings, SqliteStore, SyncContext,
    item,
};

/// Start a callback-based call and block until its completion fires.
pub fn wait<T: Send + 'static>(start: impl FnOnce(Completion<T>)) -> offsync::Result<T> {
    let (tx, rx) = std::sync::mpsc::channel();
    start(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    rx.recv_timeout(Duration::from_secs(10))
        .expect("completion was not delivered")
}

pub fn obj(value: Value) -> Item {
    value.as_object().expect("object literal").clone()
}

/// Deterministic server timestamp `n` seconds into the fixture epoch.
pub fn ts(n: u32) -> String {
    let base = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
    item::format_timestamp(base + chrono::Duration::seconds(i64::from(n)))
}

pub fn context_with(remote: Arc<dyn RemoteClient>, page_size: u32) -> (Arc<SqliteStore>, SyncContext) {
    let store = Arc::new(SqliteStore::open_in_memory().expect("in-memory store"));
    let settings = Settings { page_size, ..Settings::default() };
    let ctx = SyncContext::with_settings(store.clone(), remote, settings).expect("context");
    (store, ctx)
}

pub fn context(remote: Arc<dyn RemoteClient>) -> (Arc<SqliteStore>, SyncContext) {
    context_with(remote, 50)
}

/// One remote call, for wire-traffic assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Insert(String, String),
    Update(String, String),
    Delete(String, String),
    Query(String),
}

#[derive(Debug, Clone)]
pub enum FailMode {
    /// Every call fails with a transport error.
    Transport,
    /// Every call fails with an authorization error.
    Auth,
    /// Writes touching this item id fail with a conflict carrying the
    /// server copy.
    ConflictOn(String),
}

#[derive(Default)]
struct ServerState {
    tables: HashMap<String, BTreeMap<String, Item>>,
    calls: Vec<Call>,
    next_version: u64,
    clock: u32,
    fail: Option<FailMode>,
}

/// In-memory stand-in for the mobile backend: versions rows, stamps
/// `__updatedAt`, soft-deletes into tombstones and answers paged
/// queries.
pub struct FakeRemote {
    state: Mutex<ServerState>,
}

impl FakeRemote {
    pub fn new() -> FakeRemote {
        FakeRemote {
            state: Mutex::new(ServerState { next_version: 1, clock: 1000, ..ServerState::default() }),
        }
    }

    /// Place rows on the server verbatim (the caller controls system
    /// fields), bypassing versioning and the call log.
    pub fn seed(&self, table: &str, rows: Vec<Item>) {
        let mut state = self.state.lock().unwrap();
        let table = state.tables.entry(table.to_string()).or_default();
        for row in rows {
            let id = item::id(&row).expect("seeded row needs an id").to_string();
            table.insert(id, row);
        }
    }

    pub fn fail_with(&self, mode: Option<FailMode>) {
        self.state.lock().unwrap().fail = mode;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Item> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .and_then(|rows| rows.get(id).cloned())
    }

    fn check_fail(state: &ServerState, id: Option<&str>, table: &str) -> Result<(), RemoteError> {
        match &state.fail {
            Some(FailMode::Transport) => Err(RemoteError::Transport("injected transport failure".into())),
            Some(FailMode::Auth) => Err(RemoteError::Auth),
            Some(FailMode::ConflictOn(target)) if id == Some(target.as_str()) => Err(RemoteError::Conflict {
                server_item: state.tables.get(table).and_then(|rows| rows.get(target.as_str()).cloned()),
            }),
            _ => Ok(()),
        }
    }

    fn stamp(state: &mut ServerState, row: &mut Item) {
        state.clock += 1;
        state.next_version += 1;
        row.insert("__updatedAt".to_string(), Value::String(ts(state.clock)));
        row.insert("__version".to_string(), Value::String(state.next_version.to_string()));
    }
}

impl RemoteClient for FakeRemote {
    fn insert(&self, table: &str, item: &Item) -> Result<Item, RemoteError> {
        let mut state = self.state.lock().unwrap();
        let id = item::id(item)
            .ok_or(RemoteError::Validation { status: 400, message: "missing id".into() })?
            .to_string();
        Self::check_fail(&state, Some(&id), table)?;
        state.calls.push(Call::Insert(table.to_string(), id.clone()));

        if let Some(existing) = state.tables.get(table).and_then(|rows| rows.get(&id)) {
            return Err(RemoteError::Conflict { server_item: Some(existing.clone()) });
        }
        let mut stored = item.clone();
        stored.insert("__createdAt".to_string(), json!(ts(state.clock)));
        Self::stamp(&mut state, &mut stored);
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(id, stored.clone());
        Ok(stored)
    }

    fn update(&self, table: &str, item: &Item) -> Result<Item, RemoteError> {
        let mut state = self.state.lock().unwrap();
        let id = item::id(item)
            .ok_or(RemoteError::Validation { status: 400, message: "missing id".into() })?
            .to_string();
        Self::check_fail(&state, Some(&id), table)?;
        state.calls.push(Call::Update(table.to_string(), id.clone()));

        let Some(current) = state.tables.get(table).and_then(|rows| rows.get(&id).cloned()) else {
            return Err(RemoteError::NotFound);
        };
        if let (Some(sent), Some(held)) = (item::version(item), item::version(&current))
            && sent != held
        {
            return Err(RemoteError::PreconditionFailed { server_item: Some(current) });
        }
        let mut stored = item.clone();
        Self::stamp(&mut state, &mut stored);
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(id, stored.clone());
        Ok(stored)
    }

    fn delete(&self, table: &str, item_id: &str, version: Option<&str>) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        Self::check_fail(&state, Some(item_id), table)?;
        state.calls.push(Call::Delete(table.to_string(), item_id.to_string()));

        let Some(current) = state.tables.get(table).and_then(|rows| rows.get(item_id).cloned()) else {
            return Err(RemoteError::NotFound);
        };
        if let (Some(sent), Some(held)) = (version, item::version(&current))
            && sent != held
        {
            return Err(RemoteError::PreconditionFailed { server_item: Some(current) });
        }
        // Soft delete: the tombstone stays visible to pulls.
        let mut tombstone = current;
        tombstone.insert("__deleted".to_string(), json!(true));
        Self::stamp(&mut state, &mut tombstone);
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(item_id.to_string(), tombstone);
        Ok(())
    }

    fn query(&self, query: &Query) -> Result<Page, RemoteError> {
        let mut state = self.state.lock().unwrap();
        Self::check_fail(&state, None, &query.table)?;
        state.calls.push(Call::Query(query.table.clone()));

        let rows: Vec<Item> = state
            .tables
            .get(&query.table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        let (items, _total) = run_query(rows, query);
        Ok(Page { items })
    }
}

/// Remote wrapper that injects one local mutation while the first
/// query is being answered, to exercise merges racing the writer.
pub struct MutatingRemote {
    inner: Arc<FakeRemote>,
    ctx: Mutex<Option<SyncContext>>,
    injected: Item,
    fired: AtomicBool,
}

impl MutatingRemote {
    pub fn new(inner: Arc<FakeRemote>, injected: Item) -> MutatingRemote {
        MutatingRemote {
            inner,
            ctx: Mutex::new(None),
            injected,
            fired: AtomicBool::new(false),
        }
    }

    pub fn attach(&self, ctx: SyncContext) {
        *self.ctx.lock().unwrap() = Some(ctx);
    }
}

impl RemoteClient for MutatingRemote {
    fn insert(&self, table: &str, item: &Item) -> Result<Item, RemoteError> {
        self.inner.insert(table, item)
    }

    fn update(&self, table: &str, item: &Item) -> Result<Item, RemoteError> {
        self.inner.update(table, item)
    }

    fn delete(&self, table: &str, item_id: &str, version: Option<&str>) -> Result<(), RemoteError> {
        self.inner.delete(table, item_id, version)
    }

    fn query(&self, query: &Query) -> Result<Page, RemoteError> {
        if !self.fired.swap(true, Ordering::SeqCst)
            && let Some(ctx) = self.ctx.lock().unwrap().clone()
        {
            let table = ctx.table(&query.table);
            let injected = self.injected.clone();
            wait(|done| table.insert(injected, done)).expect("injected insert");
        }
        self.inner.query(query)
    }
}
