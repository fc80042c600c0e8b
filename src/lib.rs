pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod ffi;
pub mod item;
pub mod op;
pub mod pull;
pub mod push;
pub mod query;
pub mod queue;
pub mod remote;
pub mod store;
pub mod table;

pub use config::{ConfigKind, ConfigValue};
pub use context::{Completion, Settings, SyncContext};
pub use error::{Error, OperationError, Result};
pub use exec::{BoundedExecutor, CallbackExecutor};
pub use item::Item;
pub use op::{CondenseAction, OpKind, OpState, Operation, condense};
pub use push::PushHandler;
pub use query::{Filter, Query, SortDir};
pub use remote::{Page, RemoteClient, RemoteError};
pub use store::{DataSource, QueryResult, SqliteStore, StoreError, SystemProperties};
pub use table::SyncTable;
