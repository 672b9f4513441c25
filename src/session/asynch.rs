use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::SessionId;
use super::events::{SessionEvent, SessionEvents};
use super::sync::TxKind;
use crate::config::SessionOptions;
use crate::engine::{AsyncBind, AsyncConnection, AsyncPooled};
use crate::error::SqlComponentError;
use crate::results::ResultSet;
use crate::types::RowValues;

#[derive(Default)]
struct AsyncSessionState {
    conn: Option<AsyncConnection>,
    tx: Option<TxKind>,
    savepoints: Vec<String>,
    pending: Vec<(String, Vec<RowValues>)>,
    counter: u64,
}

impl AsyncSessionState {
    fn next_name(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{prefix}_{}", self.counter)
    }
}

struct AsyncSessionInner {
    id: SessionId,
    bind: AsyncBind,
    options: SessionOptions,
    events: SessionEvents,
    state: Mutex<AsyncSessionState>,
}

/// A unit of work against an [`AsyncBind`]; the awaitable counterpart of
/// [`Session`](super::Session).
#[derive(Clone)]
pub struct AsyncSession {
    inner: Arc<AsyncSessionInner>,
}

impl AsyncSession {
    pub(crate) fn new(bind: AsyncBind, options: SessionOptions, events: SessionEvents) -> Self {
        Self {
            inner: Arc::new(AsyncSessionInner {
                id: SessionId::next(),
                bind,
                options,
                events,
                state: Mutex::new(AsyncSessionState::default()),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    #[must_use]
    pub fn bind(&self) -> &AsyncBind {
        &self.inner.bind
    }

    #[must_use]
    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    /// True while a transaction is open or statements are queued.
    pub async fn in_transaction(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.tx.is_some() || !state.pending.is_empty()
    }

    /// True while the session holds a pooled connection.
    pub async fn has_connection(&self) -> bool {
        self.inner.state.lock().await.conn.is_some()
    }

    async fn connection(
        &self,
        state: &mut AsyncSessionState,
    ) -> Result<AsyncConnection, SqlComponentError> {
        if let Some(conn) = &state.conn {
            return Ok(conn.clone());
        }
        let conn = match &self.inner.bind {
            AsyncBind::Engine(engine) => engine.connect().await?,
            AsyncBind::Connection(conn) => conn.clone(),
        };
        debug!(session = %self.inner.id, "session acquired connection");
        state.conn = Some(conn.clone());
        Ok(conn)
    }

    async fn begin_on(
        &self,
        state: &mut AsyncSessionState,
        raw: &mut AsyncPooled,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), SqlComponentError> {
        let joins_outer =
            matches!(self.inner.bind, AsyncBind::Connection(_)) && raw.in_transaction();
        if joins_outer {
            let name = state.next_name("sa_join");
            raw.savepoint(&name).await?;
            state.tx = Some(TxKind::Joined(name));
        } else {
            let hooks = self.inner.bind.engine().events().begin_hooks();
            raw.begin_with(&hooks).await?;
            state.tx = Some(TxKind::Root);
        }
        events.push(SessionEvent::AfterBegin);
        Ok(())
    }

    async fn autobegin(
        &self,
        state: &mut AsyncSessionState,
        raw: &mut AsyncPooled,
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
        self.begin_on(state, raw, events).await
    }

    async fn flush_pending(
        &self,
        state: &mut AsyncSessionState,
        raw: &mut AsyncPooled,
    ) -> Result<(), SqlComponentError> {
        for (sql, params) in std::mem::take(&mut state.pending) {
            raw.execute(&sql, &params).await?;
        }
        Ok(())
    }

    fn finish(&self, events: &[SessionEvent]) {
        self.inner.events.dispatch_all(events, self.inner.id);
    }

    /// Queue a statement; it runs on the next flush, autoflushing query or commit.
    pub async fn add(&self, sql: impl Into<String>, params: Vec<RowValues>) {
        self.inner
            .state
            .lock()
            .await
            .pending
            .push((sql.into(), params));
    }

    /// Run queued statements now.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if a queued statement fails.
    pub async fn flush(&self) -> Result<(), SqlComponentError> {
        let mut events = Vec::new();
        let result = async {
            let mut state = self.inner.state.lock().await;
            if state.pending.is_empty() {
                return Ok(());
            }
            let conn = self.connection(&mut state).await?;
            let mut raw = conn.lock().await;
            self.autobegin(&mut state, &mut raw, &mut events).await?;
            self.flush_pending(&mut state, &mut raw).await
        }
        .await;
        self.finish(&events);
        result
    }

    /// Begin the session transaction explicitly.
    ///
    /// # Errors
    /// Returns `SqlComponentError::ExecutionError` if a transaction is already open.
    pub async fn begin(&self) -> Result<(), SqlComponentError> {
        let mut events = Vec::new();
        let result = async {
            let mut state = self.inner.state.lock().await;
            if state.tx.is_some() {
                return Err(SqlComponentError::ExecutionError(
                    "a transaction is already begun on this session".into(),
                ));
            }
            let conn = self.connection(&mut state).await?;
            let mut raw = conn.lock().await;
            self.begin_on(&mut state, &mut raw, &mut events).await
        }
        .await;
        self.finish(&events);
        result
    }

    /// Execute one statement inside the session transaction, returning the affected row count.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if the statement or a queued statement fails.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[RowValues],
    ) -> Result<usize, SqlComponentError> {
        let mut events = Vec::new();
        let result = async {
            let mut state = self.inner.state.lock().await;
            let conn = self.connection(&mut state).await?;
            let mut raw = conn.lock().await;
            self.autobegin(&mut state, &mut raw, &mut events).await?;
            if self.inner.options.autoflush {
                self.flush_pending(&mut state, &mut raw).await?;
            }
            raw.execute(sql, params).await
        }
        .await;
        self.finish(&events);
        result
    }

    /// Run a row-returning statement inside the session transaction.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if the statement or a queued statement fails.
    pub async fn query(
        &self,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SqlComponentError> {
        let mut events = Vec::new();
        let result = async {
            let mut state = self.inner.state.lock().await;
            let conn = self.connection(&mut state).await?;
            let mut raw = conn.lock().await;
            self.autobegin(&mut state, &mut raw, &mut events).await?;
            if self.inner.options.autoflush {
                self.flush_pending(&mut state, &mut raw).await?;
            }
            raw.query(sql, params).await
        }
        .await;
        self.finish(&events);
        result
    }

    /// Execute a parameterless batch inside the session transaction.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if any statement fails.
    pub async fn execute_batch(&self, sql: &str) -> Result<(), SqlComponentError> {
        let mut events = Vec::new();
        let result = async {
            let mut state = self.inner.state.lock().await;
            let conn = self.connection(&mut state).await?;
            let mut raw = conn.lock().await;
            self.autobegin(&mut state, &mut raw, &mut events).await?;
            if self.inner.options.autoflush {
                self.flush_pending(&mut state, &mut raw).await?;
            }
            raw.execute_batch(sql).await
        }
        .await;
        self.finish(&events);
        result
    }

    /// Open a savepoint inside the session transaction and return its name.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if `SAVEPOINT` fails.
    pub async fn begin_nested(&self) -> Result<String, SqlComponentError> {
        let mut events = Vec::new();
        let result = async {
            let mut state = self.inner.state.lock().await;
            let conn = self.connection(&mut state).await?;
            let mut raw = conn.lock().await;
            self.autobegin(&mut state, &mut raw, &mut events).await?;
            self.flush_pending(&mut state, &mut raw).await?;
            let name = state.next_name("sa_savepoint");
            raw.savepoint(&name).await?;
            state.savepoints.push(name.clone());
            Ok(name)
        }
        .await;
        self.finish(&events);
        result
    }

    /// Release the innermost savepoint.
    ///
    /// # Errors
    /// Returns `SqlComponentError::ExecutionError` when no savepoint is open.
    pub async fn commit_nested(&self) -> Result<(), SqlComponentError> {
        let mut state = self.inner.state.lock().await;
        let conn = self.connection(&mut state).await?;
        let mut raw = conn.lock().await;
        self.flush_pending(&mut state, &mut raw).await?;
        let name = state
            .savepoints
            .pop()
            .ok_or_else(|| SqlComponentError::ExecutionError("no savepoint is open".into()))?;
        raw.release(&name).await
    }

    /// Roll back to and release the innermost savepoint.
    ///
    /// # Errors
    /// Returns `SqlComponentError::ExecutionError` when no savepoint is open.
    pub async fn rollback_nested(&self) -> Result<(), SqlComponentError> {
        let mut state = self.inner.state.lock().await;
        state.pending.clear();
        let name = state
            .savepoints
            .pop()
            .ok_or_else(|| SqlComponentError::ExecutionError("no savepoint is open".into()))?;
        let conn = self.connection(&mut state).await?;
        let mut raw = conn.lock().await;
        raw.rollback_to(&name).await?;
        raw.release(&name).await
    }

    /// Flush and commit the session transaction. A joined session releases its savepoint
    /// instead, leaving the outer transaction open.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if flushing or committing fails; the transaction stays open.
    pub async fn commit(&self) -> Result<(), SqlComponentError> {
        if !self.in_transaction().await {
            return Ok(());
        }
        self.inner
            .events
            .dispatch(SessionEvent::BeforeCommit, self.inner.id);
        let mut events = Vec::new();
        let mut released = None;
        let result = async {
            let mut state = self.inner.state.lock().await;
            let conn = self.connection(&mut state).await?;
            {
                let mut raw = conn.lock().await;
                self.autobegin(&mut state, &mut raw, &mut events).await?;
                self.flush_pending(&mut state, &mut raw).await?;
                match state.tx.clone() {
                    Some(TxKind::Root) => raw.commit().await?,
                    Some(TxKind::Joined(name)) => raw.release(&name).await?,
                    None => {}
                }
            }
            state.tx = None;
            state.savepoints.clear();
            if self.inner.bind.is_engine() {
                released = state.conn.take();
            }
            events.push(SessionEvent::AfterCommit);
            Ok(())
        }
        .await;
        drop(released);
        self.finish(&events);
        result
    }

    /// Discard queued statements and roll back the session transaction.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if `ROLLBACK` fails; the transaction is discarded either way.
    pub async fn rollback(&self) -> Result<(), SqlComponentError> {
        let mut released = None;
        let result = async {
            let mut state = self.inner.state.lock().await;
            state.pending.clear();
            state.savepoints.clear();
            let Some(tx) = state.tx.take() else {
                return Ok(false);
            };
            let conn = self.connection(&mut state).await?;
            let result = {
                let mut raw = conn.lock().await;
                match tx {
                    TxKind::Root => raw.rollback().await,
                    TxKind::Joined(name) => match raw.rollback_to(&name).await {
                        Ok(()) => raw.release(&name).await,
                        Err(e) => Err(e),
                    },
                }
            };
            if self.inner.bind.is_engine() {
                released = state.conn.take();
            }
            result.map(|()| true)
        }
        .await;
        drop(released);
        match result {
            Ok(rolled_back) => {
                if rolled_back {
                    self.finish(&[SessionEvent::AfterRollback]);
                }
                Ok(())
            }
            Err(e) => {
                self.finish(&[SessionEvent::AfterRollback]);
                Err(e)
            }
        }
    }

    /// Reset any open transaction and hand the connection back. Calling it again is a no-op.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if resetting the transaction fails; the connection is then
    /// flagged so the pool discards it.
    pub async fn close(&self) -> Result<(), SqlComponentError> {
        let (tx, conn) = {
            let mut state = self.inner.state.lock().await;
            state.pending.clear();
            state.savepoints.clear();
            (state.tx.take(), state.conn.take())
        };
        let Some(conn) = conn else {
            return Ok(());
        };
        let result = {
            let mut raw = conn.lock().await;
            let reset = match tx {
                Some(TxKind::Joined(name)) => match raw.rollback_to(&name).await {
                    Ok(()) => raw.release(&name).await,
                    Err(e) => Err(e),
                },
                Some(TxKind::Root) => raw.rollback().await,
                None if self.inner.bind.is_engine() && raw.in_transaction() => {
                    raw.rollback().await
                }
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
}

impl fmt::Debug for AsyncSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSession")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}
