//! Scoped SQL sessions for a resource container.
//!
//! A [`SqlComponent`] resolves a database URL (or an existing engine or connection) into a
//! bind, builds a session factory for it and publishes both into a [`Context`]. Every scope
//! that asks the context for a session gets its own, and the session is committed (or rolled
//! back, when the scope closes with an error) and closed when that scope ends.
//!
//! Synchronous engines run on `rusqlite`; asynchronous ones on `sqlx` (`SQLite`) and
//! `tokio-postgres`.

pub mod component;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod prelude;
pub mod resolve;
pub mod results;
pub mod session;
pub mod types;
pub mod url;
pub mod utils;

pub use component::{LifecycleState, SqlComponent};
pub use config::{EngineOptions, PoolClass, ReadyCallback, SessionOptions, SqlComponentConfig};
pub use context::{Context, ScopeError, WeakContext};
pub use engine::{AsyncBind, AsyncConnection, AsyncEngine, Bind, SyncBind, SyncConnection, SyncEngine};
pub use error::SqlComponentError;
pub use executor::CommitExecutor;
pub use resolve::resolve_bind;
pub use results::{CustomDbRow, ResultSet};
pub use session::{
    AnySessionFactory, AsyncSession, AsyncSessionFactory, Session, SessionEvent, SessionEvents,
    SessionFactory, SessionId,
};
pub use types::RowValues;
pub use url::{DatabaseUrl, Dialect, Driver, ExecutionMode, UrlSource};
pub use utils::{apply_sqlite_hacks, clear_async_database, clear_database};
