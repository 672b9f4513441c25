use std::fmt;
use std::sync::Arc;

use bb8::PooledConnection;
use tracing::debug;

use super::connection::{AsyncConnection, AsyncPooled};
use super::events::EngineEvents;
use super::pool::{EnginePool, PoolSettings, PoolStatus, effective_poolclass};
use super::postgres::{PgManager, pg_config};
use super::sqlx_sqlite::SqlxSqliteManager;
use crate::config::{EngineOptions, PoolClass};
use crate::error::SqlComponentError;
use crate::url::{DatabaseUrl, Dialect, Driver, ExecutionMode};

enum AsyncPool {
    Sqlite(EnginePool<SqlxSqliteManager>),
    Postgres(EnginePool<PgManager>),
}

/// A pooled engine whose connections are driven with `.await` (sqlx, tokio-postgres).
///
/// Cloning is cheap; clones share the pool and the event listeners.
#[derive(Clone)]
pub struct AsyncEngine {
    inner: Arc<AsyncEngineInner>,
}

struct AsyncEngineInner {
    url: DatabaseUrl,
    driver: Driver,
    poolclass: PoolClass,
    events: Arc<EngineEvents>,
    pool: AsyncPool,
}

impl AsyncEngine {
    /// Build an engine for `url`. No connection is opened until the first checkout.
    ///
    /// # Errors
    /// Returns `SqlComponentError::UnsupportedMode` when the URL's driver is sync-only, or a
    /// configuration error when the URL cannot be turned into driver options.
    pub fn new(
        url: DatabaseUrl,
        options: &EngineOptions,
        poolclass: Option<PoolClass>,
    ) -> Result<Self, SqlComponentError> {
        let driver = url.driver_for(ExecutionMode::Async)?;
        let poolclass = effective_poolclass(&url, poolclass);
        let settings = PoolSettings::resolve(options, poolclass);
        let discard = poolclass == PoolClass::Null;
        let events = Arc::new(EngineEvents::default());
        let pool = match driver {
            Driver::Sqlx => AsyncPool::Sqlite(EnginePool::new(
                SqlxSqliteManager::new(
                    url.sqlite_path(),
                    options.pragmas.clone(),
                    Arc::clone(&events),
                    discard,
                ),
                settings,
            )),
            Driver::TokioPostgres => AsyncPool::Postgres(EnginePool::new(
                PgManager::new(pg_config(&url)?, Arc::clone(&events), discard),
                settings,
            )),
            Driver::Rusqlite => {
                return Err(SqlComponentError::UnsupportedMode {
                    driver: driver.name().to_string(),
                    mode: ExecutionMode::Async.to_string(),
                });
            }
        };
        debug!(url = %url, ?poolclass, "created async engine");
        Ok(Self {
            inner: Arc::new(AsyncEngineInner {
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
    pub async fn connect(&self) -> Result<AsyncConnection, SqlComponentError> {
        let pooled = self.checkout().await?;
        Ok(AsyncConnection::new(self.clone(), pooled))
    }

    pub(crate) async fn checkout(&self) -> Result<AsyncPooled, SqlComponentError> {
        Ok(match &self.inner.pool {
            AsyncPool::Sqlite(pool) => {
                let conn: PooledConnection<'static, SqlxSqliteManager> =
                    pool.current().get_owned().await?;
                AsyncPooled::Sqlite(conn)
            }
            AsyncPool::Postgres(pool) => AsyncPooled::Postgres(pool.current().get_owned().await?),
        })
    }

    /// Close every idle connection and start over with an empty pool.
    pub async fn dispose(&self) {
        match &self.inner.pool {
            AsyncPool::Sqlite(pool) => pool.dispose(),
            AsyncPool::Postgres(pool) => pool.dispose(),
        }
        // let the dropped pool's connection tasks observe the close
        tokio::task::yield_now().await;
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        match &self.inner.pool {
            AsyncPool::Sqlite(pool) => pool.status(),
            AsyncPool::Postgres(pool) => pool.status(),
        }
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
    pub fn same_engine(&self, other: &AsyncEngine) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for AsyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncEngine")
            .field("url", &self.inner.url.to_string())
            .field("driver", &self.inner.driver)
            .field("poolclass", &self.inner.poolclass)
            .finish_non_exhaustive()
    }
}
