//! sqlx-backed asynchronous `SQLite` connections.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use bb8::ManageConnection;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, ConnectOptions, Connection, Executor, Row, Statement, TypeInfo, ValueRef};
use tracing::debug;

use super::events::{BeginHook, ConnectHook, EngineEvents};
use super::framing::{TxFraming, TxTracker, is_dml};
use crate::error::SqlComponentError;
use crate::results::ResultSet;
use crate::types::RowValues;

type SqlxQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_value<'q>(query: SqlxQuery<'q>, value: &RowValues) -> SqlxQuery<'q> {
    match value {
        RowValues::Int(i) => query.bind(*i),
        RowValues::Float(f) => query.bind(*f),
        RowValues::Text(s) => query.bind(s.clone()),
        RowValues::Bool(b) => query.bind(*b),
        RowValues::Null => query.bind(None::<i64>),
        RowValues::Blob(bytes) => query.bind(bytes.clone()),
        RowValues::Timestamp(_) | RowValues::JSON(_) => query.bind(value.sqlite_text()),
    }
}

fn extract_value(row: &SqliteRow, idx: usize) -> Result<RowValues, SqlComponentError> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(RowValues::Null);
    }
    let type_name = raw.type_info().name().to_ascii_uppercase();
    Ok(match type_name.as_str() {
        "INTEGER" | "BOOLEAN" => RowValues::Int(row.try_get_unchecked::<i64, _>(idx)?),
        "REAL" => RowValues::Float(row.try_get_unchecked::<f64, _>(idx)?),
        "BLOB" => RowValues::Blob(row.try_get_unchecked::<Vec<u8>, _>(idx)?),
        _ => RowValues::Text(row.try_get_unchecked::<String, _>(idx)?),
    })
}

/// A sqlx `SQLite` connection with the transaction state the pool layer tracks for it.
pub struct SqlxRawConnection {
    conn: SqliteConnection,
    framing: TxFraming,
    tracker: TxTracker,
    broken: bool,
}

impl SqlxRawConnection {
    fn new(conn: SqliteConnection) -> Self {
        Self {
            conn,
            framing: TxFraming::Explicit,
            tracker: TxTracker::default(),
            broken: false,
        }
    }

    #[must_use]
    pub fn framing(&self) -> TxFraming {
        self.framing
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.tracker.in_transaction()
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Direct access to the sqlx connection. Transaction statements issued through it are
    /// not tracked.
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    pub(crate) async fn apply_connect_hooks(
        &mut self,
        hooks: &[ConnectHook],
    ) -> Result<(), SqlComponentError> {
        for hook in hooks {
            match hook {
                ConnectHook::SetFraming(framing) => self.framing = *framing,
                ConnectHook::Execute(sql) => self.run_batch(sql).await?,
            }
        }
        Ok(())
    }

    async fn run_batch(&mut self, sql: &str) -> Result<(), SqlComponentError> {
        (&mut self.conn).execute(sql).await?;
        self.tracker.observe(sql);
        Ok(())
    }

    async fn frame_statement(&mut self, sql: &str) -> Result<(), SqlComponentError> {
        if self.framing == TxFraming::Implicit && !self.tracker.in_transaction() && is_dml(sql) {
            self.run_batch("BEGIN").await?;
        }
        Ok(())
    }

    async fn prepare(
        &mut self,
        sql: &str,
    ) -> Result<(sqlx::sqlite::SqliteStatement<'static>, Vec<String>), SqlComponentError> {
        let prepared = (&mut self.conn).prepare(sql).await?;
        let stmt = Statement::to_owned(&prepared);
        let names = stmt
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        Ok((stmt, names))
    }

    /// Execute a single statement, returning the affected row count.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if the statement fails.
    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[RowValues],
    ) -> Result<usize, SqlComponentError> {
        self.frame_statement(sql).await?;
        let query = params
            .iter()
            .fold(sqlx::query(sql), |query, value| bind_value(query, value));
        let done = query.execute(&mut self.conn).await?;
        self.tracker.observe(sql);
        Ok(usize::try_from(done.rows_affected()).unwrap_or(usize::MAX))
    }

    /// Run a row-returning statement.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if the statement fails or a value cannot be decoded.
    pub async fn query(
        &mut self,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SqlComponentError> {
        self.frame_statement(sql).await?;
        let (stmt, column_names) = self.prepare(sql).await?;
        let query = params
            .iter()
            .fold(stmt.query(), |query, value| bind_value(query, value));
        let rows = query.fetch_all(&mut self.conn).await?;
        self.tracker.observe(sql);

        let mut result_set = ResultSet::with_capacity(rows.len());
        let col_count = column_names.len();
        result_set.set_column_names(Arc::new(column_names));
        for row in &rows {
            let mut values = Vec::with_capacity(col_count);
            for idx in 0..col_count {
                values.push(extract_value(row, idx)?);
            }
            result_set.add_row_values(values);
        }
        Ok(result_set)
    }

    /// Execute a batch of statements without parameters.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if any statement fails.
    pub async fn execute_batch(&mut self, sql: &str) -> Result<(), SqlComponentError> {
        self.frame_statement(sql).await?;
        self.run_batch(sql).await
    }

    pub(crate) async fn begin_with(&mut self, hooks: &[BeginHook]) -> Result<(), SqlComponentError> {
        if self.framing == TxFraming::Explicit {
            self.run_batch("BEGIN").await?;
        }
        for hook in hooks {
            match hook {
                BeginHook::Execute(sql) => self.run_batch(sql).await?,
            }
        }
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<(), SqlComponentError> {
        if self.tracker.in_transaction() {
            self.run_batch("COMMIT").await?;
        }
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<(), SqlComponentError> {
        if self.tracker.in_transaction() {
            self.run_batch("ROLLBACK").await?;
        }
        Ok(())
    }

    pub async fn savepoint(&mut self, name: &str) -> Result<(), SqlComponentError> {
        self.run_batch(&format!("SAVEPOINT {name}")).await
    }

    pub async fn release(&mut self, name: &str) -> Result<(), SqlComponentError> {
        self.run_batch(&format!("RELEASE SAVEPOINT {name}")).await
    }

    pub async fn rollback_to(&mut self, name: &str) -> Result<(), SqlComponentError> {
        self.run_batch(&format!("ROLLBACK TO SAVEPOINT {name}")).await
    }
}

impl fmt::Debug for SqlxRawConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlxRawConnection")
            .field("framing", &self.framing)
            .field("in_transaction", &self.tracker.in_transaction())
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

/// bb8 manager for sqlx `SQLite` connections.
#[derive(Clone)]
pub struct SqlxSqliteManager {
    path: String,
    pragmas: Arc<Vec<String>>,
    events: Arc<EngineEvents>,
    discard_on_release: bool,
}

impl SqlxSqliteManager {
    pub(crate) fn new(
        path: String,
        pragmas: Vec<String>,
        events: Arc<EngineEvents>,
        discard_on_release: bool,
    ) -> Self {
        Self {
            path,
            pragmas: Arc::new(pragmas),
            events,
            discard_on_release,
        }
    }

    fn options(&self) -> Result<SqliteConnectOptions, SqlComponentError> {
        if self.path == ":memory:" {
            Ok(SqliteConnectOptions::from_str("sqlite::memory:")?)
        } else {
            Ok(SqliteConnectOptions::new()
                .filename(&self.path)
                .create_if_missing(true))
        }
    }
}

impl ManageConnection for SqlxSqliteManager {
    type Connection = SqlxRawConnection;
    type Error = SqlComponentError;

    #[allow(clippy::manual_async_fn)]
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send {
        let manager = self.clone();
        async move {
            let conn = manager.options()?.connect().await?;
            let mut raw = SqlxRawConnection::new(conn);
            for pragma in manager.pragmas.iter() {
                (&mut raw.conn).execute(pragma.as_str()).await?;
            }
            raw.apply_connect_hooks(&manager.events.connect_hooks())
                .await?;
            debug!(framing = ?raw.framing, "opened sqlx sqlite connection");
            Ok(raw)
        }
    }

    #[allow(clippy::manual_async_fn)]
    fn is_valid(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async move { Ok(conn.conn.ping().await?) }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        self.discard_on_release || conn.broken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory() -> SqlxRawConnection {
        let conn = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .connect()
            .await
            .unwrap();
        SqlxRawConnection::new(conn)
    }

    #[tokio::test]
    async fn batches_run_on_spawned_tasks() {
        let mut raw = memory().await;
        let mut raw = tokio::spawn(async move {
            raw.execute_batch("CREATE TABLE t (id INTEGER); INSERT INTO t (id) VALUES (1)")
                .await
                .map(|()| raw)
        })
        .await
        .unwrap()
        .unwrap();

        let rs = raw.query("SELECT count(*) FROM t", &[]).await.unwrap();
        assert_eq!(rs.scalar().and_then(|v| v.as_int().copied()), Some(1));
    }

    #[tokio::test]
    async fn explicit_begin_is_tracked_until_commit() {
        let mut raw = memory().await;
        raw.execute_batch("CREATE TABLE t (id INTEGER)").await.unwrap();
        raw.begin_with(&[]).await.unwrap();
        assert!(raw.in_transaction());
        raw.execute("INSERT INTO t (id) VALUES (?1)", &[RowValues::Int(1)])
            .await
            .unwrap();
        raw.commit().await.unwrap();
        assert!(!raw.in_transaction());
    }
}
