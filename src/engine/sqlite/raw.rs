use std::fmt;

use rusqlite::types::Value;

use super::query::build_result_set;
use crate::engine::events::{BeginHook, ConnectHook};
use crate::engine::framing::{TxFraming, is_dml};
use crate::error::SqlComponentError;
use crate::results::ResultSet;

/// A rusqlite connection plus the framing state the pool layer tracks for it.
pub struct SqliteRawConnection {
    pub(crate) conn: rusqlite::Connection,
    framing: TxFraming,
    broken: bool,
}

impl SqliteRawConnection {
    pub(crate) fn new(conn: rusqlite::Connection) -> Self {
        Self {
            conn,
            framing: TxFraming::Implicit,
            broken: false,
        }
    }

    #[must_use]
    pub fn framing(&self) -> TxFraming {
        self.framing
    }

    pub fn set_framing(&mut self, framing: TxFraming) {
        self.framing = framing;
    }

    /// True while `SQLite` reports an open transaction on this connection.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Flag the connection so the pool discards it instead of reusing it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Direct access to the underlying rusqlite connection.
    pub fn connection(&mut self) -> &mut rusqlite::Connection {
        &mut self.conn
    }

    pub(crate) fn apply_connect_hooks(
        &mut self,
        hooks: &[ConnectHook],
    ) -> Result<(), SqlComponentError> {
        for hook in hooks {
            match hook {
                ConnectHook::SetFraming(framing) => self.framing = *framing,
                ConnectHook::Execute(sql) => self.conn.execute_batch(sql)?,
            }
        }
        Ok(())
    }

    /// Open the transaction implicit framing defers to the first data-modifying statement.
    fn frame_statement(&mut self, sql: &str) -> Result<(), SqlComponentError> {
        if self.framing == TxFraming::Implicit && self.conn.is_autocommit() && is_dml(sql) {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }

    /// Execute a single statement, returning the affected row count.
    ///
    /// Row-returning statements are stepped to completion and their rows discarded; a
    /// `RETURNING` clause counts one affected row per returned row, anything else counts zero.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if preparing or running the statement fails.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize, SqlComponentError> {
        self.frame_statement(sql)?;
        let mut stmt = self.conn.prepare(sql)?;
        let refs: Vec<&dyn rusqlite::ToSql> =
            params.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
        if stmt.column_count() == 0 {
            return Ok(stmt.execute(&refs[..])?);
        }
        let mut rows = stmt.query(&refs[..])?;
        let mut returned = 0;
        while rows.next()?.is_some() {
            returned += 1;
        }
        Ok(if is_dml(sql) { returned } else { 0 })
    }

    /// Run a row-returning statement.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if preparing, running or decoding fails.
    pub fn query(&mut self, sql: &str, params: &[Value]) -> Result<ResultSet, SqlComponentError> {
        self.frame_statement(sql)?;
        let mut stmt = self.conn.prepare(sql)?;
        build_result_set(&mut stmt, params)
    }

    /// Execute a batch of statements without parameters.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if any statement fails.
    pub fn execute_batch(&mut self, sql: &str) -> Result<(), SqlComponentError> {
        self.frame_statement(sql)?;
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Start a root transaction: the driver's own framing first, then the engine's begin hooks.
    pub(crate) fn begin_with(&mut self, hooks: &[BeginHook]) -> Result<(), SqlComponentError> {
        if self.framing == TxFraming::Explicit {
            self.conn.execute_batch("BEGIN")?;
        }
        for hook in hooks {
            match hook {
                BeginHook::Execute(sql) => self.conn.execute_batch(sql)?,
            }
        }
        Ok(())
    }

    /// Commit the open transaction, if any.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if `COMMIT` fails.
    pub fn commit(&mut self) -> Result<(), SqlComponentError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    /// Roll back the open transaction, if any.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if `ROLLBACK` fails.
    pub fn rollback(&mut self) -> Result<(), SqlComponentError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    pub fn savepoint(&mut self, name: &str) -> Result<(), SqlComponentError> {
        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        Ok(())
    }

    pub fn release(&mut self, name: &str) -> Result<(), SqlComponentError> {
        self.conn.execute_batch(&format!("RELEASE SAVEPOINT {name}"))?;
        Ok(())
    }

    pub fn rollback_to(&mut self, name: &str) -> Result<(), SqlComponentError> {
        self.conn
            .execute_batch(&format!("ROLLBACK TO SAVEPOINT {name}"))?;
        Ok(())
    }
}

impl fmt::Debug for SqliteRawConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteRawConnection")
            .field("framing", &self.framing)
            .field("in_transaction", &self.in_transaction())
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> SqliteRawConnection {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let mut raw = SqliteRawConnection::new(conn);
        raw.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .unwrap();
        raw
    }

    #[test]
    fn implicit_framing_defers_begin_to_first_write() {
        let mut raw = memory();
        raw.begin_with(&[]).unwrap();
        assert!(!raw.in_transaction());

        raw.execute("INSERT INTO t (id) VALUES (?1)", &[Value::Integer(1)])
            .unwrap();
        assert!(raw.in_transaction());
        raw.rollback().unwrap();

        let rs = raw.query("SELECT COUNT(*) FROM t", &[]).unwrap();
        assert_eq!(rs.scalar().and_then(|v| v.as_int().copied()), Some(0));
    }

    #[test]
    fn execute_accepts_row_returning_statements() {
        let mut raw = memory();
        assert_eq!(raw.execute("SELECT 1", &[]).unwrap(), 0);
        assert_eq!(raw.execute("PRAGMA user_version", &[]).unwrap(), 0);
        assert!(!raw.in_transaction());

        let inserted = raw
            .execute(
                "INSERT INTO t (id) VALUES (?1), (?2) RETURNING id",
                &[Value::Integer(1), Value::Integer(2)],
            )
            .unwrap();
        assert_eq!(inserted, 2);
        assert!(raw.in_transaction());
        raw.commit().unwrap();
        let rs = raw.query("SELECT COUNT(*) FROM t", &[]).unwrap();
        assert_eq!(rs.scalar().and_then(|v| v.as_int().copied()), Some(2));
    }

    #[test]
    fn implicit_framing_turns_leading_savepoint_into_outer_transaction() {
        let mut raw = memory();
        raw.savepoint("sp").unwrap();
        raw.execute("INSERT INTO t (id) VALUES (1)", &[]).unwrap();
        raw.release("sp").unwrap();
        // the release committed; nothing left to roll back
        assert!(!raw.in_transaction());
        raw.rollback().unwrap();
        let rs = raw.query("SELECT COUNT(*) FROM t", &[]).unwrap();
        assert_eq!(rs.scalar().and_then(|v| v.as_int().copied()), Some(1));
    }

    #[test]
    fn manual_framing_with_begin_hook_keeps_savepoints_nested() {
        let mut raw = memory();
        raw.apply_connect_hooks(&[ConnectHook::SetFraming(TxFraming::Manual)])
            .unwrap();
        raw.begin_with(&[BeginHook::Execute("BEGIN".into())])
            .unwrap();
        assert!(raw.in_transaction());

        raw.savepoint("sp").unwrap();
        raw.execute("INSERT INTO t (id) VALUES (1)", &[]).unwrap();
        raw.release("sp").unwrap();
        assert!(raw.in_transaction());
        raw.rollback().unwrap();

        let rs = raw.query("SELECT COUNT(*) FROM t", &[]).unwrap();
        assert_eq!(rs.scalar().and_then(|v| v.as_int().copied()), Some(0));
    }
}
