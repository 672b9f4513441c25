//! Engines, pooled connections and the [`Bind`] a session factory is built from.

pub mod async_engine;
pub mod connection;
pub mod events;
pub mod framing;
pub(crate) mod pool;
pub mod postgres;
pub mod sqlite;
pub mod sqlx_sqlite;
pub mod sync_engine;

use std::sync::Arc;

pub use async_engine::AsyncEngine;
pub use connection::{AsyncConnection, AsyncPooled, SyncConnection};
pub use events::{BeginHook, ConnectHook, EngineEvents};
pub use framing::TxFraming;
pub use pool::PoolStatus;
pub use sync_engine::SyncEngine;

use crate::url::{Dialect, Driver, ExecutionMode};

/// Something synchronous sessions can be bound to.
#[derive(Debug, Clone)]
pub enum SyncBind {
    Engine(SyncEngine),
    /// An already checked-out connection, e.g. one wrapped in an outer test transaction.
    Connection(SyncConnection),
}

/// Something asynchronous sessions can be bound to.
#[derive(Debug, Clone)]
pub enum AsyncBind {
    Engine(AsyncEngine),
    Connection(AsyncConnection),
}

/// The engine or connection a component's sessions run against.
#[derive(Debug, Clone)]
pub enum Bind {
    Sync(SyncBind),
    Async(AsyncBind),
}

impl SyncBind {
    /// The engine behind the bind; for a connection, the engine it was checked out of.
    #[must_use]
    pub fn engine(&self) -> &SyncEngine {
        match self {
            SyncBind::Engine(engine) => engine,
            SyncBind::Connection(conn) => conn.engine(),
        }
    }

    #[must_use]
    pub fn is_engine(&self) -> bool {
        matches!(self, SyncBind::Engine(_))
    }
}

impl AsyncBind {
    /// The engine behind the bind; for a connection, the engine it was checked out of.
    #[must_use]
    pub fn engine(&self) -> &AsyncEngine {
        match self {
            AsyncBind::Engine(engine) => engine,
            AsyncBind::Connection(conn) => conn.engine(),
        }
    }

    #[must_use]
    pub fn is_engine(&self) -> bool {
        matches!(self, AsyncBind::Engine(_))
    }
}

impl Bind {
    #[must_use]
    pub fn is_async(&self) -> bool {
        matches!(self, Bind::Async(_))
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Bind::Sync(_) => ExecutionMode::Sync,
            Bind::Async(_) => ExecutionMode::Async,
        }
    }

    /// True when the bind is an engine the component owns and must dispose.
    #[must_use]
    pub fn is_engine(&self) -> bool {
        match self {
            Bind::Sync(bind) => bind.is_engine(),
            Bind::Async(bind) => bind.is_engine(),
        }
    }

    #[must_use]
    pub fn dialect(&self) -> Dialect {
        match self {
            Bind::Sync(bind) => bind.engine().dialect(),
            Bind::Async(bind) => bind.engine().dialect(),
        }
    }

    #[must_use]
    pub fn driver(&self) -> Driver {
        match self {
            Bind::Sync(bind) => bind.engine().driver(),
            Bind::Async(bind) => bind.engine().driver(),
        }
    }

    /// Listeners of the underlying engine.
    #[must_use]
    pub fn events(&self) -> &Arc<EngineEvents> {
        match self {
            Bind::Sync(bind) => bind.engine().events(),
            Bind::Async(bind) => bind.engine().events(),
        }
    }

    /// Current pool snapshot of the underlying engine.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        match self {
            Bind::Sync(bind) => bind.engine().status(),
            Bind::Async(bind) => bind.engine().status(),
        }
    }
}

impl From<SyncEngine> for Bind {
    fn from(engine: SyncEngine) -> Self {
        Bind::Sync(SyncBind::Engine(engine))
    }
}

impl From<SyncConnection> for Bind {
    fn from(conn: SyncConnection) -> Self {
        Bind::Sync(SyncBind::Connection(conn))
    }
}

impl From<AsyncEngine> for Bind {
    fn from(engine: AsyncEngine) -> Self {
        Bind::Async(AsyncBind::Engine(engine))
    }
}

impl From<AsyncConnection> for Bind {
    fn from(conn: AsyncConnection) -> Self {
        Bind::Async(AsyncBind::Connection(conn))
    }
}

impl From<SyncBind> for Bind {
    fn from(bind: SyncBind) -> Self {
        Bind::Sync(bind)
    }
}

impl From<AsyncBind> for Bind {
    fn from(bind: AsyncBind) -> Self {
        Bind::Async(bind)
    }
}
