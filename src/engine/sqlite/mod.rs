//! rusqlite-backed synchronous engine internals.

pub mod manager;
pub mod params;
pub mod query;
pub mod raw;

use std::sync::Arc;

use crate::error::SqlComponentError;

pub use manager::SqliteManager;
pub use params::Params;
pub use raw::SqliteRawConnection;

/// Shared handle to a pooled rusqlite connection.
pub type SharedSqliteConnection = Arc<tokio::sync::Mutex<SqliteRawConnection>>;

/// Run `func` against the connection on Tokio's blocking pool.
pub(crate) async fn run_blocking<F, R>(
    conn: SharedSqliteConnection,
    func: F,
) -> Result<R, SqlComponentError>
where
    F: FnOnce(&mut SqliteRawConnection) -> Result<R, SqlComponentError> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = conn.blocking_lock();
        func(&mut guard)
    })
    .await
    .map_err(|e| SqlComponentError::ExecutionError(format!("sqlite spawn_blocking join error: {e}")))?
}
