/// How a driver frames transactions around the statements it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxFraming {
    /// `BEGIN` is deferred to the first data-modifying statement and `COMMIT`/`ROLLBACK` are
    /// skipped while no transaction is open. A `SAVEPOINT` issued first therefore becomes the
    /// outermost transaction and its `RELEASE` commits. This is the rusqlite default.
    #[default]
    Implicit,
    /// The driver never emits `BEGIN`; begin listeners on the engine are expected to.
    Manual,
    /// The driver emits `BEGIN` itself when a transaction starts.
    Explicit,
}

/// First keyword of a statement, uppercased.
pub(crate) fn statement_keyword(sql: &str) -> String {
    sql.trim_start()
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

/// Statements before which an implicitly framed driver opens a transaction.
pub(crate) fn is_dml(sql: &str) -> bool {
    matches!(
        statement_keyword(sql).as_str(),
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE"
    )
}

/// Tracks whether a connection is inside a transaction for drivers that do not report it.
///
/// Only statements that pass through the connection wrapper are observed.
#[derive(Debug, Default, Clone)]
pub(crate) struct TxTracker {
    in_transaction: bool,
    savepoint_root: Option<String>,
}

impl TxTracker {
    pub(crate) fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub(crate) fn observe(&mut self, sql: &str) {
        for statement in sql.split(';') {
            self.observe_one(statement);
        }
    }

    fn observe_one(&mut self, statement: &str) {
        let mut words = statement.split_whitespace();
        let keyword = words.next().unwrap_or_default().to_ascii_uppercase();
        let second = words.next().unwrap_or_default().to_ascii_uppercase();
        match keyword.as_str() {
            "BEGIN" | "START" => self.in_transaction = true,
            "COMMIT" | "END" => self.reset(),
            "ROLLBACK" if second != "TO" => self.reset(),
            "SAVEPOINT" if !self.in_transaction => {
                self.in_transaction = true;
                self.savepoint_root = Some(second);
            }
            "RELEASE" => {
                let name = if second == "SAVEPOINT" {
                    words.next().unwrap_or_default().to_ascii_uppercase()
                } else {
                    second
                };
                if self.savepoint_root.as_deref() == Some(name.as_str()) {
                    self.reset();
                }
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.in_transaction = false;
        self.savepoint_root = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dml_detection() {
        assert!(is_dml("  insert into t values (1)"));
        assert!(is_dml("UPDATE t SET a = 1"));
        assert!(!is_dml("select 1"));
        assert!(!is_dml("SAVEPOINT sp1"));
    }

    #[test]
    fn tracker_follows_transaction_statements() {
        let mut tracker = TxTracker::default();
        tracker.observe("BEGIN");
        assert!(tracker.in_transaction());
        tracker.observe("SAVEPOINT a; ROLLBACK TO SAVEPOINT a");
        assert!(tracker.in_transaction());
        tracker.observe("COMMIT");
        assert!(!tracker.in_transaction());

        tracker.observe("savepoint outer");
        assert!(tracker.in_transaction());
        tracker.observe("RELEASE SAVEPOINT outer");
        assert!(!tracker.in_transaction());
    }
}
