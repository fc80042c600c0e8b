//! C bridge for mobile hosts. The host owns the HTTP stack and hands
//! it in as a vtable of callbacks; the engine owns the SQLite store
//! and the queue. All wrappers here block until the engine completion
//! fires, so Swift/Kotlin callers can dispatch them on their own
//! worker queues.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_longlong, c_void};
use std::sync::Arc;
use std::sync::mpsc;

use crate::context::{Completion, SyncContext};
use crate::error::{Error, Result};
use crate::item::Item;
use crate::query::Query;
use crate::remote::{Page, RemoteClient, RemoteError};
use crate::store::SqliteStore;

pub const OFFSYNC_OK: c_int = 0;
pub const OFFSYNC_ERR_STORE: c_int = 1;
pub const OFFSYNC_ERR_REMOTE: c_int = 2;
pub const OFFSYNC_ERR_INVALID: c_int = 3;
pub const OFFSYNC_ERR_HANDLE: c_int = 4;
pub const OFFSYNC_ERR_PUSH: c_int = 5;
pub const OFFSYNC_ERR_CANCELLED: c_int = 6;
pub const OFFSYNC_ERR_PURGE: c_int = 7;

/// Opaque handle owning a sync context over a SQLite file.
pub struct OffsyncHandle {
    ctx: SyncContext,
}

thread_local! {
    static LAST_ERROR: RefCell<(c_int, String)> = RefCell::new((0, String::new()));
}

fn set_last_error(code: c_int, msg: &str) {
    LAST_ERROR.with(|le| *le.borrow_mut() = (code, msg.to_string()));
}

fn clear_last_error() {
    LAST_ERROR.with(|le| *le.borrow_mut() = (0, String::new()));
}

fn error_code(err: &Error) -> c_int {
    match err {
        Error::Store(_) | Error::StoreInconsistent(_) => OFFSYNC_ERR_STORE,
        Error::Remote(_) | Error::PullAborted(_) => OFFSYNC_ERR_REMOTE,
        Error::PushAborted { .. } => OFFSYNC_ERR_PUSH,
        Error::PushCancelled | Error::PullCancelled | Error::ContextClosed => OFFSYNC_ERR_CANCELLED,
        Error::PurgeAborted => OFFSYNC_ERR_PURGE,
        _ => OFFSYNC_ERR_INVALID,
    }
}

fn ptr_to_str<'a>(ptr: *const c_char) -> std::result::Result<&'a str, ()> {
    if ptr.is_null() {
        return Err(());
    }
    unsafe { CStr::from_ptr(ptr).to_str().map_err(|_| ()) }
}

fn opt_ptr_to_str<'a>(ptr: *const c_char) -> std::result::Result<Option<&'a str>, ()> {
    if ptr.is_null() {
        return Ok(None);
    }
    Ok(Some(ptr_to_str(ptr)?))
}

fn to_cstring_ptr(s: &str) -> *mut c_char {
    CString::new(s).map(|cs| cs.into_raw()).unwrap_or(std::ptr::null_mut())
}

/// Free a C string returned by this library.
#[unsafe(no_mangle)]
pub extern "C" fn offsync_string_free(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    unsafe {
        let _ = CString::from_raw(s);
    }
}

/// Host status codes for remote callbacks.
pub const OFFSYNC_REMOTE_OK: c_int = 0;
pub const OFFSYNC_REMOTE_TRANSPORT: c_int = 1;
pub const OFFSYNC_REMOTE_AUTH: c_int = 2;
pub const OFFSYNC_REMOTE_CONFLICT: c_int = 3;
pub const OFFSYNC_REMOTE_PRECONDITION: c_int = 4;
pub const OFFSYNC_REMOTE_VALIDATION: c_int = 5;
pub const OFFSYNC_REMOTE_NOT_FOUND: c_int = 6;

/// Remote table CRUD supplied by the host. Out-strings are allocated
/// by the host and released through `free_string` once the engine has
/// copied them. On conflict/precondition failures the host may hand
/// the server copy back through the out parameter.
///
/// The engine invokes these callbacks from its own sync thread; the
/// host must make them thread-safe.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct OffsyncRemoteVtable {
    pub user_data: *mut c_void,
    pub free_string: Option<extern "C" fn(user_data: *mut c_void, s: *mut c_char)>,
    pub insert: Option<
        extern "C" fn(
            user_data: *mut c_void,
            table: *const c_char,
            item_json: *const c_char,
            out_item_json: *mut *mut c_char,
        ) -> c_int,
    >,
    pub update: Option<
        extern "C" fn(
            user_data: *mut c_void,
            table: *const c_char,
            item_json: *const c_char,
            out_item_json: *mut *mut c_char,
        ) -> c_int,
    >,
    pub delete: Option<
        extern "C" fn(
            user_data: *mut c_void,
            table: *const c_char,
            item_id: *const c_char,
            version: *const c_char,
        ) -> c_int,
    >,
    pub query: Option<
        extern "C" fn(
            user_data: *mut c_void,
            query_json: *const c_char,
            out_items_json: *mut *mut c_char,
        ) -> c_int,
    >,
}

struct HostRemote {
    vtable: OffsyncRemoteVtable,
}

// The vtable carries raw host pointers; the host contract above makes
// the callbacks usable from any engine thread.
unsafe impl Send for HostRemote {}
unsafe impl Sync for HostRemote {}

impl HostRemote {
    fn take_host_string(&self, ptr: *mut c_char) -> Option<String> {
        if ptr.is_null() {
            return None;
        }
        let copied = unsafe { CStr::from_ptr(ptr) }.to_str().ok().map(str::to_string);
        if let Some(free) = self.vtable.free_string {
            free(self.vtable.user_data, ptr);
        }
        copied
    }

    fn map_failure(&self, code: c_int, payload: Option<String>) -> RemoteError {
        let server_item = payload
            .as_deref()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .and_then(|value| value.as_object().cloned());
        match code {
            OFFSYNC_REMOTE_AUTH => RemoteError::Auth,
            OFFSYNC_REMOTE_CONFLICT => RemoteError::Conflict { server_item },
            OFFSYNC_REMOTE_PRECONDITION => RemoteError::PreconditionFailed { server_item },
            OFFSYNC_REMOTE_VALIDATION => RemoteError::Validation {
                status: 400,
                message: payload.unwrap_or_else(|| "rejected by host".to_string()),
            },
            OFFSYNC_REMOTE_NOT_FOUND => RemoteError::NotFound,
            _ => RemoteError::Transport(format!("host callback failed with code {code}").into()),
        }
    }

    fn write_op(
        &self,
        callback: Option<
            extern "C" fn(*mut c_void, *const c_char, *const c_char, *mut *mut c_char) -> c_int,
        >,
        table: &str,
        item: &Item,
    ) -> std::result::Result<Item, RemoteError> {
        let callback = callback.ok_or(RemoteError::Validation {
            status: 0,
            message: "host remote callback is missing".into(),
        })?;
        let table_c = cstring(table)?;
        let body_c = cstring(&serde_json::Value::Object(item.clone()).to_string())?;
        let mut out: *mut c_char = std::ptr::null_mut();
        let code = callback(self.vtable.user_data, table_c.as_ptr(), body_c.as_ptr(), &mut out);
        let payload = self.take_host_string(out);
        if code != OFFSYNC_REMOTE_OK {
            return Err(self.map_failure(code, payload));
        }
        payload
            .as_deref()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .and_then(|value| value.as_object().cloned())
            .ok_or_else(|| RemoteError::Transport("host returned an unreadable item".into()))
    }
}

fn cstring(s: &str) -> std::result::Result<CString, RemoteError> {
    CString::new(s).map_err(|_| RemoteError::Validation {
        status: 0,
        message: "embedded NUL in request data".into(),
    })
}

impl RemoteClient for HostRemote {
    fn insert(&self, table: &str, item: &Item) -> std::result::Result<Item, RemoteError> {
        self.write_op(self.vtable.insert, table, item)
    }

    fn update(&self, table: &str, item: &Item) -> std::result::Result<Item, RemoteError> {
        self.write_op(self.vtable.update, table, item)
    }

    fn delete(&self, table: &str, item_id: &str, version: Option<&str>) -> std::result::Result<(), RemoteError> {
        let callback = self.vtable.delete.ok_or(RemoteError::Validation {
            status: 0,
            message: "host remote callback is missing".into(),
        })?;
        let table_c = cstring(table)?;
        let id_c = cstring(item_id)?;
        let version_c = version.map(cstring).transpose()?;
        let version_ptr = version_c.as_ref().map_or(std::ptr::null(), |v| v.as_ptr());
        let code = callback(self.vtable.user_data, table_c.as_ptr(), id_c.as_ptr(), version_ptr);
        if code != OFFSYNC_REMOTE_OK {
            return Err(self.map_failure(code, None));
        }
        Ok(())
    }

    fn query(&self, query: &Query) -> std::result::Result<Page, RemoteError> {
        let callback = self.vtable.query.ok_or(RemoteError::Validation {
            status: 0,
            message: "host remote callback is missing".into(),
        })?;
        let query_json = serde_json::to_string(query)
            .map_err(|err| RemoteError::Transport(Box::new(err)))?;
        let query_c = cstring(&query_json)?;
        let mut out: *mut c_char = std::ptr::null_mut();
        let code = callback(self.vtable.user_data, query_c.as_ptr(), &mut out);
        let payload = self.take_host_string(out);
        if code != OFFSYNC_REMOTE_OK {
            return Err(self.map_failure(code, payload));
        }
        let raw = payload.ok_or_else(|| RemoteError::Transport("host returned no page".into()))?;
        let rows: Vec<serde_json::Value> = serde_json::from_str(&raw)
            .map_err(|err| RemoteError::Transport(Box::new(err)))?;
        let items = rows
            .into_iter()
            .filter_map(|value| value.as_object().cloned())
            .collect();
        Ok(Page { items })
    }
}

fn wait<T: Send + 'static>(start: impl FnOnce(Completion<T>)) -> Result<T> {
    let (tx, rx) = mpsc::channel();
    start(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    rx.recv().map_err(|_| Error::ContextClosed)?
}

fn with_handle<T>(
    handle: *mut OffsyncHandle,
    fallback: T,
    body: impl FnOnce(&OffsyncHandle) -> std::result::Result<T, Error>,
) -> T {
    let Some(handle) = (unsafe { handle.as_ref() }) else {
        set_last_error(OFFSYNC_ERR_HANDLE, "null handle");
        return fallback;
    };
    match body(handle) {
        Ok(value) => {
            clear_last_error();
            value
        }
        Err(err) => {
            set_last_error(error_code(&err), &err.to_string());
            fallback
        }
    }
}

/// Open a context over a SQLite file (or ":memory:"). Returns null on
/// failure; inspect `offsync_last_error_message`.
#[unsafe(no_mangle)]
pub extern "C" fn offsync_open(path: *const c_char, remote: OffsyncRemoteVtable) -> *mut OffsyncHandle {
    let Ok(path) = ptr_to_str(path) else {
        set_last_error(OFFSYNC_ERR_INVALID, "invalid path");
        return std::ptr::null_mut();
    };
    let store = match SqliteStore::open(path) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            set_last_error(OFFSYNC_ERR_STORE, &err.to_string());
            return std::ptr::null_mut();
        }
    };
    match SyncContext::open(store, Arc::new(HostRemote { vtable: remote })) {
        Ok(ctx) => {
            clear_last_error();
            Box::into_raw(Box::new(OffsyncHandle { ctx }))
        }
        Err(err) => {
            set_last_error(error_code(&err), &err.to_string());
            std::ptr::null_mut()
        }
    }
}

/// Close a previously opened context, cancelling outstanding work.
#[unsafe(no_mangle)]
pub extern "C" fn offsync_close(handle: *mut OffsyncHandle) {
    if handle.is_null() {
        return;
    }
    unsafe {
        let _ = Box::from_raw(handle);
    }
}

fn parse_item(raw: &str) -> std::result::Result<Item, Error> {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|value| value.as_object().cloned())
        .ok_or(Error::InvalidParameter("item is not a JSON object"))
}

fn mutate_blocking(
    handle: *mut OffsyncHandle,
    table: *const c_char,
    item_json: *const c_char,
    apply: fn(&crate::table::SyncTable, Item, Completion<Item>),
) -> *mut c_char {
    with_handle(handle, std::ptr::null_mut(), |h| {
        let table = ptr_to_str(table).map_err(|_| Error::InvalidParameter("invalid table name"))?;
        let raw = ptr_to_str(item_json).map_err(|_| Error::InvalidParameter("invalid item JSON"))?;
        let item = parse_item(raw)?;
        let bound = h.ctx.table(table);
        let stored = wait(|done| apply(&bound, item, done))?;
        Ok(to_cstring_ptr(&serde_json::Value::Object(stored).to_string()))
    })
}

/// Queue an insert. Returns the stored item as JSON (with the
/// generated id when the input had none), or null on failure.
#[unsafe(no_mangle)]
pub extern "C" fn offsync_insert(
    handle: *mut OffsyncHandle,
    table: *const c_char,
    item_json: *const c_char,
) -> *mut c_char {
    mutate_blocking(handle, table, item_json, |t, item, done| t.insert(item, done))
}

/// Queue an update. Returns the stored item as JSON, or null.
#[unsafe(no_mangle)]
pub extern "C" fn offsync_update(
    handle: *mut OffsyncHandle,
    table: *const c_char,
    item_json: *const c_char,
) -> *mut c_char {
    mutate_blocking(handle, table, item_json, |t, item, done| t.update(item, done))
}

/// Queue a delete. Returns 0 on success.
#[unsafe(no_mangle)]
pub extern "C" fn offsync_delete(
    handle: *mut OffsyncHandle,
    table: *const c_char,
    item_json: *const c_char,
) -> c_int {
    with_handle(handle, OFFSYNC_ERR_HANDLE, |h| {
        let table = ptr_to_str(table).map_err(|_| Error::InvalidParameter("invalid table name"))?;
        let raw = ptr_to_str(item_json).map_err(|_| Error::InvalidParameter("invalid item JSON"))?;
        let item = parse_item(raw)?;
        let bound = h.ctx.table(table);
        wait(|done| bound.delete(item, done))?;
        Ok(OFFSYNC_OK)
    })
}

/// Read one local item. Returns its JSON, or null when absent (error
/// code 0) or on failure (non-zero error code).
#[unsafe(no_mangle)]
pub extern "C" fn offsync_read(
    handle: *mut OffsyncHandle,
    table: *const c_char,
    item_id: *const c_char,
) -> *mut c_char {
    with_handle(handle, std::ptr::null_mut(), |h| {
        let table = ptr_to_str(table).map_err(|_| Error::InvalidParameter("invalid table name"))?;
        let id = ptr_to_str(item_id).map_err(|_| Error::InvalidParameter("invalid item id"))?;
        match h.ctx.table(table).read_with_id(id)? {
            Some(found) => Ok(to_cstring_ptr(&serde_json::Value::Object(found).to_string())),
            None => Ok(std::ptr::null_mut()),
        }
    })
}

/// Drain pending operations to the server. Returns 0 when everything
/// drained cleanly.
#[unsafe(no_mangle)]
pub extern "C" fn offsync_push(handle: *mut OffsyncHandle) -> c_int {
    with_handle(handle, OFFSYNC_ERR_HANDLE, |h| {
        wait(|done| h.ctx.push(done))?;
        Ok(OFFSYNC_OK)
    })
}

/// Pull server rows for `table`. A non-null `query_id` makes the pull
/// incremental. Returns rows processed, or -1 on failure.
#[unsafe(no_mangle)]
pub extern "C" fn offsync_pull(
    handle: *mut OffsyncHandle,
    table: *const c_char,
    query_id: *const c_char,
) -> c_longlong {
    with_handle(handle, -1, |h| {
        let table = ptr_to_str(table).map_err(|_| Error::InvalidParameter("invalid table name"))?;
        let query_id = opt_ptr_to_str(query_id).map_err(|_| Error::InvalidParameter("invalid query id"))?;
        let bound = h.ctx.table(table);
        let processed = wait(|done| bound.pull(Query::table(table), query_id, done))?;
        Ok(processed as c_longlong)
    })
}

/// Purge every local row of `table`. Returns 0 on success; fails with
/// OFFSYNC_ERR_PURGE while the table has pending operations and
/// `force` is 0.
#[unsafe(no_mangle)]
pub extern "C" fn offsync_purge(handle: *mut OffsyncHandle, table: *const c_char, force: c_int) -> c_int {
    with_handle(handle, OFFSYNC_ERR_HANDLE, |h| {
        let table = ptr_to_str(table).map_err(|_| Error::InvalidParameter("invalid table name"))?;
        let bound = h.ctx.table(table);
        wait(|done| bound.purge(None, None, force != 0, done))?;
        Ok(OFFSYNC_OK)
    })
}

/// Number of queued operations, or -1 on failure.
#[unsafe(no_mangle)]
pub extern "C" fn offsync_pending_count(handle: *mut OffsyncHandle) -> c_longlong {
    with_handle(handle, -1, |h| Ok(h.ctx.pending_count()? as c_longlong))
}

/// Last error code for the current thread.
#[unsafe(no_mangle)]
pub extern "C" fn offsync_last_error_code() -> c_int {
    LAST_ERROR.with(|le| le.borrow().0)
}

/// Last error message for the current thread as a newly allocated C
/// string. Free with `offsync_string_free`.
#[unsafe(no_mangle)]
pub extern "C" fn offsync_last_error_message() -> *mut c_char {
    to_cstring_ptr(&LAST_ERROR.with(|le| le.borrow().1.clone()))
}
