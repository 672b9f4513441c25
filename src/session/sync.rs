use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::events::{SessionEvent, SessionEvents};
use super::SessionId;
use crate::config::SessionOptions;
use crate::engine::sqlite::{Params, SqliteRawConnection};
use crate::engine::{SyncBind, SyncConnection};
use crate::error::SqlComponentError;
use crate::results::ResultSet;
use crate::types::RowValues;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TxKind {
    /// The session opened the connection's outermost transaction.
    Root,
    /// The bind connection was already in a transaction; the session runs inside this savepoint.
    Joined(String),
}

#[derive(Default)]
struct SessionState {
    conn: Option<SyncConnection>,
    tx: Option<TxKind>,
    savepoints: Vec<String>,
    pending: Vec<(String, Vec<RowValues>)>,
    counter: u64,
    release_conn: bool,
}

impl SessionState {
    fn next_name(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{prefix}_{}", self.counter)
    }
}

struct SessionInner {
    id: SessionId,
    bind: SyncBind,
    options: SessionOptions,
    events: SessionEvents,
    state: Mutex<SessionState>,
}

/// A unit of work against a [`SyncBind`].
///
/// The `*_blocking` methods do the work on the calling thread and must not be called from an
/// async task; the async methods move them onto Tokio's blocking pool. A connection is checked
/// out on first use and a transaction begins with the first statement. `close` returns the
/// connection to the pool; the session can be used again afterwards.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

fn runtime() -> Result<Handle, SqlComponentError> {
    Handle::try_current().map_err(|e| {
        SqlComponentError::ConnectionError(format!("sync sessions need a Tokio runtime: {e}"))
    })
}

impl Session {
    pub(crate) fn new(bind: SyncBind, options: SessionOptions, events: SessionEvents) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: SessionId::next(),
                bind,
                options,
                events,
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    #[must_use]
    pub fn bind(&self) -> &SyncBind {
        &self.inner.bind
    }

    #[must_use]
    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    /// True once a transaction has begun or statements are queued, until commit, rollback or
    /// close.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        let state = self.lock_state();
        state.tx.is_some() || !state.pending.is_empty()
    }

    /// True while the session holds a pooled connection.
    #[must_use]
    pub fn has_connection(&self) -> bool {
        self.lock_state().conn.is_some()
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn connection(&self, state: &mut SessionState) -> Result<SyncConnection, SqlComponentError> {
        if let Some(conn) = &state.conn {
            return Ok(conn.clone());
        }
        let conn = match &self.inner.bind {
            SyncBind::Engine(engine) => runtime()?.block_on(engine.connect())?,
            SyncBind::Connection(conn) => conn.clone(),
        };
        debug!(session = %self.inner.id, "session acquired connection");
        state.conn = Some(conn.clone());
        Ok(conn)
    }

    fn begin_on(
        &self,
        state: &mut SessionState,
        raw: &mut SqliteRawConnection,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), SqlComponentError> {
        let joins_outer = matches!(self.inner.bind, SyncBind::Connection(_)) && raw.in_transaction();
        if joins_outer {
            let name = state.next_name("sa_join");
            raw.savepoint(&name)?;
            state.tx = Some(TxKind::Joined(name));
        } else {
            let hooks = self.inner.bind.engine().events().begin_hooks();
            raw.begin_with(&hooks)?;
            state.tx = Some(TxKind::Root);
        }
        events.push(SessionEvent::AfterBegin);
        Ok(())
    }

    fn autobegin(
        &self,
        state: &mut SessionState,
        raw: &mut SqliteRawConnection,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), SqlComponentError> {
        if state.tx.is_some() {
            return Ok(());
        }
        if !self.inner.options.autobegin {
            return Err(SqlComponentError::ExecutionError(
                "autobegin is disabled; call begin() before running statements".into(),
            ));
        }
        self.begin_on(state, raw, events)
    }

    fn flush_pending(
        &self,
        state: &mut SessionState,
        raw: &mut SqliteRawConnection,
    ) -> Result<(), SqlComponentError> {
        for (sql, params) in std::mem::take(&mut state.pending) {
            raw.execute(&sql, Params::convert(&params).as_values())?;
        }
        Ok(())
    }

    /// Lock the session, then its connection, and run `func`. Events collected by `func` are
    /// dispatched after both locks are released.
    fn with_raw<R>(
        &self,
        func: impl FnOnce(
            &mut SessionState,
            &mut SqliteRawConnection,
            &mut Vec<SessionEvent>,
        ) -> Result<R, SqlComponentError>,
    ) -> Result<R, SqlComponentError> {
        let mut events = Vec::new();
        let mut released = None;
        let result = {
            let mut state = self.lock_state();
            let result = self.connection(&mut state).and_then(|conn| {
                let handle = conn.handle();
                let mut raw = handle.blocking_lock();
                func(&mut state, &mut raw, &mut events)
            });
            if std::mem::take(&mut state.release_conn) {
                released = state.conn.take();
            }
            result
        };
        drop(released);
        self.inner.events.dispatch_all(&events, self.inner.id);
        result
    }

    fn release_after_finish(&self, state: &mut SessionState) {
        if self.inner.bind.is_engine() {
            state.release_conn = true;
        }
    }

    /// Queue a statement; it runs on the next flush, autoflushing query or commit.
    pub fn add(&self, sql: impl Into<String>, params: Vec<RowValues>) {
        self.lock_state().pending.push((sql.into(), params));
    }

    /// Run queued statements now.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if a queued statement fails.
    pub fn flush_blocking(&self) -> Result<(), SqlComponentError> {
        if self.lock_state().pending.is_empty() {
            return Ok(());
        }
        self.with_raw(|state, raw, events| {
            self.autobegin(state, raw, events)?;
            self.flush_pending(state, raw)
        })
    }

    /// Begin the session transaction explicitly.
    ///
    /// # Errors
    /// Returns `SqlComponentError::ExecutionError` if a transaction is already open.
    pub fn begin_blocking(&self) -> Result<(), SqlComponentError> {
        self.with_raw(|state, raw, events| {
            if state.tx.is_some() {
                return Err(SqlComponentError::ExecutionError(
                    "a transaction is already begun on this session".into(),
                ));
            }
            self.begin_on(state, raw, events)
        })
    }

    /// Execute one statement inside the session transaction, returning the affected row count.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if the statement or a queued statement fails.
    pub fn execute_blocking(
        &self,
        sql: &str,
        params: &[RowValues],
    ) -> Result<usize, SqlComponentError> {
        self.with_raw(|state, raw, events| {
            self.autobegin(state, raw, events)?;
            if self.inner.options.autoflush {
                self.flush_pending(state, raw)?;
            }
            raw.execute(sql, Params::convert(params).as_values())
        })
    }

    /// Run a row-returning statement inside the session transaction.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if the statement or a queued statement fails.
    pub fn query_blocking(
        &self,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SqlComponentError> {
        self.with_raw(|state, raw, events| {
            self.autobegin(state, raw, events)?;
            if self.inner.options.autoflush {
                self.flush_pending(state, raw)?;
            }
            raw.query(sql, Params::convert(params).as_values())
        })
    }

    /// Execute a parameterless batch inside the session transaction.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if any statement fails.
    pub fn execute_batch_blocking(&self, sql: &str) -> Result<(), SqlComponentError> {
        self.with_raw(|state, raw, events| {
            self.autobegin(state, raw, events)?;
            if self.inner.options.autoflush {
                self.flush_pending(state, raw)?;
            }
            raw.execute_batch(sql)
        })
    }

    /// Open a savepoint inside the session transaction and return its name.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if `SAVEPOINT` fails.
    pub fn begin_nested_blocking(&self) -> Result<String, SqlComponentError> {
        self.with_raw(|state, raw, events| {
            self.autobegin(state, raw, events)?;
            self.flush_pending(state, raw)?;
            let name = state.next_name("sa_savepoint");
            raw.savepoint(&name)?;
            state.savepoints.push(name.clone());
            Ok(name)
        })
    }

    /// Release the innermost savepoint.
    ///
    /// # Errors
    /// Returns `SqlComponentError::ExecutionError` when no savepoint is open.
    pub fn commit_nested_blocking(&self) -> Result<(), SqlComponentError> {
        self.with_raw(|state, raw, _| {
            self.flush_pending(state, raw)?;
            let name = state.savepoints.pop().ok_or_else(|| {
                SqlComponentError::ExecutionError("no savepoint is open".into())
            })?;
            raw.release(&name)
        })
    }

    /// Roll back to and release the innermost savepoint.
    ///
    /// # Errors
    /// Returns `SqlComponentError::ExecutionError` when no savepoint is open.
    pub fn rollback_nested_blocking(&self) -> Result<(), SqlComponentError> {
        self.with_raw(|state, raw, _| {
            state.pending.clear();
            let name = state.savepoints.pop().ok_or_else(|| {
                SqlComponentError::ExecutionError("no savepoint is open".into())
            })?;
            raw.rollback_to(&name)?;
            raw.release(&name)
        })
    }

    /// Flush and commit the session transaction. A joined session releases its savepoint
    /// instead, leaving the outer transaction open.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if flushing or committing fails; the transaction stays open.
    pub fn commit_blocking(&self) -> Result<(), SqlComponentError> {
        if !self.in_transaction() {
            return Ok(());
        }
        self.inner
            .events
            .dispatch(SessionEvent::BeforeCommit, self.inner.id);
        self.with_raw(|state, raw, events| {
            self.autobegin(state, raw, events)?;
            self.flush_pending(state, raw)?;
            match state.tx.clone() {
                Some(TxKind::Root) => raw.commit()?,
                Some(TxKind::Joined(name)) => raw.release(&name)?,
                None => {}
            }
            state.tx = None;
            state.savepoints.clear();
            self.release_after_finish(state);
            events.push(SessionEvent::AfterCommit);
            Ok(())
        })
    }

    /// Discard queued statements and roll back the session transaction.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if `ROLLBACK` fails; the transaction is discarded either way.
    pub fn rollback_blocking(&self) -> Result<(), SqlComponentError> {
        {
            let mut state = self.lock_state();
            state.pending.clear();
            if state.tx.is_none() {
                return Ok(());
            }
        }
        self.with_raw(|state, raw, events| {
            state.savepoints.clear();
            let result = match state.tx.take() {
                Some(TxKind::Root) => raw.rollback(),
                Some(TxKind::Joined(name)) => raw.rollback_to(&name).and_then(|()| raw.release(&name)),
                None => Ok(()),
            };
            self.release_after_finish(state);
            events.push(SessionEvent::AfterRollback);
            result
        })
    }

    /// Reset any open transaction and hand the connection back. Calling it again is a no-op.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if resetting the transaction fails; the connection is then
    /// flagged so the pool discards it.
    pub fn close_blocking(&self) -> Result<(), SqlComponentError> {
        let (tx, conn) = {
            let mut state = self.lock_state();
            state.pending.clear();
            state.savepoints.clear();
            state.release_conn = false;
            (state.tx.take(), state.conn.take())
        };
        let Some(conn) = conn else {
            return Ok(());
        };
        let result = {
            let handle = conn.handle();
            let mut raw = handle.blocking_lock();
            let reset = match tx {
                Some(TxKind::Joined(name)) => {
                    raw.rollback_to(&name).and_then(|()| raw.release(&name))
                }
                Some(TxKind::Root) => raw.rollback(),
                None if self.inner.bind.is_engine() && raw.in_transaction() => raw.rollback(),
                None => Ok(()),
            };
            if reset.is_err() {
                raw.mark_broken();
            }
            reset
        };
        drop(conn);
        match &result {
            Ok(()) => debug!(session = %self.inner.id, "session closed"),
            Err(e) => warn!(session = %self.inner.id, error = %e, "session reset failed on close"),
        }
        result
    }

    async fn offload<R, F>(&self, func: F) -> Result<R, SqlComponentError>
    where
        F: FnOnce(&Session) -> Result<R, SqlComponentError> + Send + 'static,
        R: Send + 'static,
    {
        let session = self.clone();
        tokio::task::spawn_blocking(move || func(&session))
            .await
            .map_err(|e| {
                SqlComponentError::ExecutionError(format!("session spawn_blocking join error: {e}"))
            })?
    }

    /// Run queued statements on a blocking thread.
    ///
    /// # Errors
    /// Same as [`flush_blocking`](Session::flush_blocking).
    pub async fn flush(&self) -> Result<(), SqlComponentError> {
        self.offload(Session::flush_blocking).await
    }

    /// Begin the session transaction explicitly.
    ///
    /// # Errors
    /// Same as [`begin_blocking`](Session::begin_blocking).
    pub async fn begin(&self) -> Result<(), SqlComponentError> {
        self.offload(Session::begin_blocking).await
    }

    /// Execute a statement inside the session transaction, returning the affected row count.
    ///
    /// # Errors
    /// Same as [`execute_blocking`](Session::execute_blocking).
    pub async fn execute(&self, sql: &str, params: &[RowValues]) -> Result<usize, SqlComponentError> {
        let sql = sql.to_owned();
        let params = params.to_vec();
        self.offload(move |s| s.execute_blocking(&sql, &params)).await
    }

    /// Run a row-returning statement inside the session transaction.
    ///
    /// # Errors
    /// Same as [`query_blocking`](Session::query_blocking).
    pub async fn query(&self, sql: &str, params: &[RowValues]) -> Result<ResultSet, SqlComponentError> {
        let sql = sql.to_owned();
        let params = params.to_vec();
        self.offload(move |s| s.query_blocking(&sql, &params)).await
    }

    /// Execute a parameterless batch inside the session transaction.
    ///
    /// # Errors
    /// Same as [`execute_batch_blocking`](Session::execute_batch_blocking).
    pub async fn execute_batch(&self, sql: &str) -> Result<(), SqlComponentError> {
        let sql = sql.to_owned();
        self.offload(move |s| s.execute_batch_blocking(&sql)).await
    }

    /// Open a savepoint and return its name.
    ///
    /// # Errors
    /// Same as [`begin_nested_blocking`](Session::begin_nested_blocking).
    pub async fn begin_nested(&self) -> Result<String, SqlComponentError> {
        self.offload(Session::begin_nested_blocking).await
    }

    /// Release the innermost savepoint.
    ///
    /// # Errors
    /// Same as [`commit_nested_blocking`](Session::commit_nested_blocking).
    pub async fn commit_nested(&self) -> Result<(), SqlComponentError> {
        self.offload(Session::commit_nested_blocking).await
    }

    /// Roll back to the innermost savepoint and release it.
    ///
    /// # Errors
    /// Same as [`rollback_nested_blocking`](Session::rollback_nested_blocking).
    pub async fn rollback_nested(&self) -> Result<(), SqlComponentError> {
        self.offload(Session::rollback_nested_blocking).await
    }

    /// Flush and commit the session transaction.
    ///
    /// # Errors
    /// Same as [`commit_blocking`](Session::commit_blocking).
    pub async fn commit(&self) -> Result<(), SqlComponentError> {
        self.offload(Session::commit_blocking).await
    }

    /// Discard queued statements and roll back the session transaction.
    ///
    /// # Errors
    /// Same as [`rollback_blocking`](Session::rollback_blocking).
    pub async fn rollback(&self) -> Result<(), SqlComponentError> {
        self.offload(Session::rollback_blocking).await
    }

    /// Roll back anything still open and return the connection. Safe to call repeatedly.
    ///
    /// # Errors
    /// Same as [`close_blocking`](Session::close_blocking).
    pub async fn close(&self) -> Result<(), SqlComponentError> {
        self.offload(Session::close_blocking).await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("in_transaction", &self.in_transaction())
            .finish_non_exhaustive()
    }
}
