use std::fmt;
use std::sync::Arc;

use bb8::PooledConnection;
use tracing::debug;

use super::connection::SyncConnection;
use super::events::EngineEvents;
use super::pool::{EnginePool, PoolSettings, PoolStatus, effective_poolclass};
use super::sqlite::SqliteManager;
use crate::config::{EngineOptions, PoolClass};
use crate::error::SqlComponentError;
use crate::url::{DatabaseUrl, Dialect, Driver, ExecutionMode};

/// A pooled engine whose connections block the calling thread (rusqlite).
///
/// Cloning is cheap; clones share the pool and the event listeners.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncEngineInner>,
}

struct SyncEngineInner {
    url: DatabaseUrl,
    driver: Driver,
    poolclass: PoolClass,
    events: Arc<EngineEvents>,
    pool: EnginePool<SqliteManager>,
}

impl SyncEngine {
    /// Build an engine for `url`. No connection is opened until the first checkout.
    ///
    /// # Errors
    /// Returns `SqlComponentError::UnsupportedMode` when the URL's driver is async-only.
    pub fn new(
        url: DatabaseUrl,
        options: &EngineOptions,
        poolclass: Option<PoolClass>,
    ) -> Result<Self, SqlComponentError> {
        let driver = url.driver_for(ExecutionMode::Sync)?;
        let poolclass = effective_poolclass(&url, poolclass);
        let events = Arc::new(EngineEvents::default());
        let manager = match driver {
            Driver::Rusqlite => SqliteManager::new(
                url.sqlite_path(),
                options.cross_thread.unwrap_or(false),
                options.pragmas.clone(),
                Arc::clone(&events),
                poolclass == PoolClass::Null,
            ),
            other => {
                return Err(SqlComponentError::UnsupportedMode {
                    driver: other.name().to_string(),
                    mode: ExecutionMode::Sync.to_string(),
                });
            }
        };
        let pool = EnginePool::new(manager, PoolSettings::resolve(options, poolclass));
        debug!(url = %url, ?poolclass, "created sync engine");
        Ok(Self {
            inner: Arc::new(SyncEngineInner {
                url,
                driver,
                poolclass,
                events,
                pool,
            }),
        })
    }

    /// Check a connection out of the pool.
    ///
    /// # Errors
    /// Returns `SqlComponentError` if no connection can be opened or the checkout times out.
    pub async fn connect(&self) -> Result<SyncConnection, SqlComponentError> {
        let pooled = self.checkout().await?;
        Ok(SyncConnection::new(self.clone(), pooled))
    }

    pub(crate) async fn checkout(
        &self,
    ) -> Result<PooledConnection<'static, SqliteManager>, SqlComponentError> {
        Ok(self.inner.pool.current().get_owned().await?)
    }

    /// Close every idle connection and start over with an empty pool.
    pub fn dispose(&self) {
        self.inner.pool.dispose();
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.inner.pool.status()
    }

    #[must_use]
    pub fn events(&self) -> &Arc<EngineEvents> {
        &self.inner.events
    }

    #[must_use]
    pub fn url(&self) -> &DatabaseUrl {
        &self.inner.url
    }

    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.inner.url.dialect
    }

    #[must_use]
    pub fn driver(&self) -> Driver {
        self.inner.driver
    }

    #[must_use]
    pub fn poolclass(&self) -> PoolClass {
        self.inner.poolclass
    }

    /// True when both handles refer to the same engine.
    #[must_use]
    pub fn same_engine(&self, other: &SyncEngine) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("url", &self.inner.url.to_string())
            .field("driver", &self.inner.driver)
            .field("poolclass", &self.inner.poolclass)
            .finish_non_exhaustive()
    }
}
