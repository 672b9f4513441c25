use std::fmt;
use std::sync::Arc;

use bb8::PooledConnection;
use tokio::sync::{Mutex, MutexGuard};

use super::async_engine::AsyncEngine;
use super::postgres::{PgManager, PgRawConnection};
use super::sqlite::{Params, SharedSqliteConnection, SqliteManager, SqliteRawConnection, run_blocking};
use super::sqlx_sqlite::{SqlxRawConnection, SqlxSqliteManager};
use super::sync_engine::SyncEngine;
use crate::error::SqlComponentError;
use crate::results::ResultSet;
use crate::types::RowValues;

/// A connection checked out of a [`SyncEngine`].
///
/// Clones share the same physical connection; it goes back to the pool when the last clone
/// is dropped.
#[derive(Clone)]
pub struct SyncConnection {
    inner: Arc<SyncConnectionInner>,
}

struct SyncConnectionInner {
    engine: SyncEngine,
    pooled: PooledConnection<'static, SqliteManager>,
}

impl SyncConnection {
    pub(crate) fn new(engine: SyncEngine, pooled: PooledConnection<'static, SqliteManager>) -> Self {
        Self {
            inner: Arc::new(SyncConnectionInner { engine, pooled }),
        }
    }

    /// The engine this connection was checked out of.
    #[must_use]
    pub fn engine(&self) -> &SyncEngine {
        &self.inner.engine
    }

    pub(crate) fn handle(&self) -> SharedSqliteConnection {
        Arc::clone(&*self.inner.pooled)
    }

    /// Run `func` against the raw connection on Tokio's blocking pool.
    ///
    /// # Errors
    /// Returns whatever `func` returns, or `SqlComponentError::ExecutionError` if the blocking
    /// task fails to join.
    pub async fn with_connection<F, R>(&self, func: F) -> Result<R, SqlComponentError>
    where
        F: FnOnce(&mut SqliteRawConnection) -> Result<R, SqlComponentError> + Send + 'static,
        R: Send + 'static,
    {
        run_blocking(self.handle(), func).await
    }

    /// Execute a single statement, returning the affected row count.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if the statement fails.
    pub async fn execute(&self, sql: &str, params: &[RowValues]) -> Result<usize, SqlComponentError> {
        let sql = sql.to_owned();
        let params = Params::convert(params);
        self.with_connection(move |raw| raw.execute(&sql, params.as_values()))
            .await
    }

    /// Run a row-returning statement.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if the statement fails.
    pub async fn query(&self, sql: &str, params: &[RowValues]) -> Result<ResultSet, SqlComponentError> {
        let sql = sql.to_owned();
        let params = Params::convert(params);
        self.with_connection(move |raw| raw.query(&sql, params.as_values()))
            .await
    }

    /// Execute a batch of statements without parameters.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if any statement fails.
    pub async fn execute_batch(&self, sql: &str) -> Result<(), SqlComponentError> {
        let sql = sql.to_owned();
        self.with_connection(move |raw| raw.execute_batch(&sql))
            .await
    }

    /// Begin a root transaction, running the engine's begin listeners.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if a framing statement fails.
    pub async fn begin(&self) -> Result<(), SqlComponentError> {
        let hooks = self.inner.engine.events().begin_hooks();
        self.with_connection(move |raw| raw.begin_with(&hooks))
            .await
    }

    pub async fn commit(&self) -> Result<(), SqlComponentError> {
        self.with_connection(SqliteRawConnection::commit).await
    }

    pub async fn rollback(&self) -> Result<(), SqlComponentError> {
        self.with_connection(SqliteRawConnection::rollback).await
    }

    pub async fn savepoint(&self, name: &str) -> Result<(), SqlComponentError> {
        let name = name.to_owned();
        self.with_connection(move |raw| raw.savepoint(&name)).await
    }

    pub async fn release_savepoint(&self, name: &str) -> Result<(), SqlComponentError> {
        let name = name.to_owned();
        self.with_connection(move |raw| raw.release(&name)).await
    }

    pub async fn rollback_to_savepoint(&self, name: &str) -> Result<(), SqlComponentError> {
        let name = name.to_owned();
        self.with_connection(move |raw| raw.rollback_to(&name)).await
    }

    /// True while the connection has an open transaction.
    pub async fn in_transaction(&self) -> bool {
        self.handle().lock().await.in_transaction()
    }
}

impl fmt::Debug for SyncConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConnection")
            .field("engine", &self.inner.engine)
            .finish_non_exhaustive()
    }
}

/// A pooled connection of an [`AsyncEngine`], whichever driver backs it.
pub enum AsyncPooled {
    Sqlite(PooledConnection<'static, SqlxSqliteManager>),
    Postgres(PooledConnection<'static, PgManager>),
}

macro_rules! dispatch {
    ($self:ident, $conn:ident => $body:expr) => {
        match $self {
            AsyncPooled::Sqlite($conn) => $body,
            AsyncPooled::Postgres($conn) => $body,
        }
    };
}

impl AsyncPooled {
    pub async fn execute(&mut self, sql: &str, params: &[RowValues]) -> Result<usize, SqlComponentError> {
        dispatch!(self, conn => conn.execute(sql, params).await)
    }

    pub async fn query(&mut self, sql: &str, params: &[RowValues]) -> Result<ResultSet, SqlComponentError> {
        dispatch!(self, conn => conn.query(sql, params).await)
    }

    pub async fn execute_batch(&mut self, sql: &str) -> Result<(), SqlComponentError> {
        dispatch!(self, conn => conn.execute_batch(sql).await)
    }

    pub(crate) async fn begin_with(
        &mut self,
        hooks: &[super::events::BeginHook],
    ) -> Result<(), SqlComponentError> {
        dispatch!(self, conn => conn.begin_with(hooks).await)
    }

    pub async fn commit(&mut self) -> Result<(), SqlComponentError> {
        dispatch!(self, conn => conn.commit().await)
    }

    pub async fn rollback(&mut self) -> Result<(), SqlComponentError> {
        dispatch!(self, conn => conn.rollback().await)
    }

    pub async fn savepoint(&mut self, name: &str) -> Result<(), SqlComponentError> {
        dispatch!(self, conn => conn.savepoint(name).await)
    }

    pub async fn release(&mut self, name: &str) -> Result<(), SqlComponentError> {
        dispatch!(self, conn => conn.release(name).await)
    }

    pub async fn rollback_to(&mut self, name: &str) -> Result<(), SqlComponentError> {
        dispatch!(self, conn => conn.rollback_to(name).await)
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        dispatch!(self, conn => conn.in_transaction())
    }

    pub fn mark_broken(&mut self) {
        dispatch!(self, conn => conn.mark_broken());
    }

    /// The sqlx connection, when this is a `SQLite` connection.
    pub fn as_sqlx(&mut self) -> Option<&mut SqlxRawConnection> {
        match self {
            AsyncPooled::Sqlite(conn) => Some(&mut **conn),
            AsyncPooled::Postgres(_) => None,
        }
    }

    /// The postgres client wrapper, when this is a Postgres connection.
    pub fn as_postgres(&mut self) -> Option<&mut PgRawConnection> {
        match self {
            AsyncPooled::Postgres(conn) => Some(&mut **conn),
            AsyncPooled::Sqlite(_) => None,
        }
    }
}

/// A connection checked out of an [`AsyncEngine`].
///
/// Clones share the same physical connection; it goes back to the pool when the last clone
/// is dropped.
#[derive(Clone)]
pub struct AsyncConnection {
    inner: Arc<AsyncConnectionInner>,
}

struct AsyncConnectionInner {
    engine: AsyncEngine,
    conn: Mutex<AsyncPooled>,
}

impl AsyncConnection {
    pub(crate) fn new(engine: AsyncEngine, pooled: AsyncPooled) -> Self {
        Self {
            inner: Arc::new(AsyncConnectionInner {
                engine,
                conn: Mutex::new(pooled),
            }),
        }
    }

    #[must_use]
    pub fn engine(&self) -> &AsyncEngine {
        &self.inner.engine
    }

    /// Exclusive access to the pooled connection.
    pub async fn lock(&self) -> MutexGuard<'_, AsyncPooled> {
        self.inner.conn.lock().await
    }

    pub async fn execute(&self, sql: &str, params: &[RowValues]) -> Result<usize, SqlComponentError> {
        self.lock().await.execute(sql, params).await
    }

    pub async fn query(&self, sql: &str, params: &[RowValues]) -> Result<ResultSet, SqlComponentError> {
        self.lock().await.query(sql, params).await
    }

    pub async fn execute_batch(&self, sql: &str) -> Result<(), SqlComponentError> {
        self.lock().await.execute_batch(sql).await
    }

    /// Begin a root transaction, running the engine's begin listeners.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if a framing statement fails.
    pub async fn begin(&self) -> Result<(), SqlComponentError> {
        let hooks = self.inner.engine.events().begin_hooks();
        self.lock().await.begin_with(&hooks).await
    }

    pub async fn commit(&self) -> Result<(), SqlComponentError> {
        self.lock().await.commit().await
    }

    pub async fn rollback(&self) -> Result<(), SqlComponentError> {
        self.lock().await.rollback().await
    }

    pub async fn savepoint(&self, name: &str) -> Result<(), SqlComponentError> {
        self.lock().await.savepoint(name).await
    }

    pub async fn release_savepoint(&self, name: &str) -> Result<(), SqlComponentError> {
        self.lock().await.release(name).await
    }

    pub async fn rollback_to_savepoint(&self, name: &str) -> Result<(), SqlComponentError> {
        self.lock().await.rollback_to(name).await
    }

    pub async fn in_transaction(&self) -> bool {
        self.lock().await.in_transaction()
    }
}

impl fmt::Debug for AsyncConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncConnection")
            .field("engine", &self.inner.engine)
            .finish_non_exhaustive()
    }
}
