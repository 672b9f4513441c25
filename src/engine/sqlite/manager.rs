use std::future::Future;
use std::sync::Arc;

use bb8::ManageConnection;
use rusqlite::OpenFlags;
use tokio::sync::Mutex;
use tracing::debug;

use super::raw::SqliteRawConnection;
use super::{SharedSqliteConnection, run_blocking};
use crate::engine::events::EngineEvents;
use crate::error::SqlComponentError;

/// bb8 manager for rusqlite connections.
#[derive(Clone)]
pub struct SqliteManager {
    path: String,
    flags: OpenFlags,
    pragmas: Arc<Vec<String>>,
    events: Arc<EngineEvents>,
    discard_on_release: bool,
}

impl SqliteManager {
    pub(crate) fn new(
        path: String,
        cross_thread: bool,
        pragmas: Vec<String>,
        events: Arc<EngineEvents>,
        discard_on_release: bool,
    ) -> Self {
        let mut flags = OpenFlags::default();
        if cross_thread {
            flags.remove(OpenFlags::SQLITE_OPEN_NO_MUTEX);
            flags.insert(OpenFlags::SQLITE_OPEN_FULL_MUTEX);
        }
        Self {
            path,
            flags,
            pragmas: Arc::new(pragmas),
            events,
            discard_on_release,
        }
    }

    fn open(&self) -> Result<SqliteRawConnection, SqlComponentError> {
        let conn = rusqlite::Connection::open_with_flags(&self.path, self.flags)?;
        let mut raw = SqliteRawConnection::new(conn);
        for pragma in self.pragmas.iter() {
            raw.conn.execute_batch(pragma)?;
        }
        raw.apply_connect_hooks(&self.events.connect_hooks())?;
        Ok(raw)
    }
}

impl ManageConnection for SqliteManager {
    type Connection = SharedSqliteConnection;
    type Error = SqlComponentError;

    #[allow(clippy::manual_async_fn)]
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send {
        let manager = self.clone();
        async move {
            let raw = tokio::task::spawn_blocking(move || manager.open())
                .await
                .map_err(|e| {
                    SqlComponentError::ConnectionError(format!("sqlite connect join error: {e}"))
                })??;
            debug!(framing = ?raw.framing(), "opened sqlite connection");
            Ok(Arc::new(Mutex::new(raw)))
        }
    }

    #[allow(clippy::manual_async_fn)]
    fn is_valid(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let handle = Arc::clone(conn);
        async move {
            run_blocking(handle, |raw| {
                raw.conn.query_row("SELECT 1", [], |_| Ok(()))?;
                Ok(())
            })
            .await
        }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        self.discard_on_release || conn.try_lock().is_ok_and(|raw| raw.is_broken())
    }
}
