use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use bb8::{ManageConnection, Pool};
use tracing::debug;

use crate::config::{EngineOptions, PoolClass};
use crate::url::DatabaseUrl;

const DEFAULT_POOL_SIZE: u32 = 5;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Snapshot of an engine's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Physical connections currently open.
    pub connections: u32,
    pub idle_connections: u32,
    /// Connections handed out and not yet returned.
    pub checked_out: u32,
    pub max_size: u32,
}

/// Pool class an engine ends up with when none was configured.
pub(crate) fn effective_poolclass(url: &DatabaseUrl, configured: Option<PoolClass>) -> PoolClass {
    configured.unwrap_or(if url.is_memory() {
        PoolClass::Singleton
    } else {
        PoolClass::Queue
    })
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PoolSettings {
    max_size: u32,
    connection_timeout: Duration,
    idle_timeout: Option<Duration>,
    max_lifetime: Option<Duration>,
    test_on_checkout: bool,
}

impl PoolSettings {
    pub(crate) fn resolve(options: &EngineOptions, class: PoolClass) -> Self {
        let max_size = match class {
            PoolClass::Singleton => 1,
            PoolClass::Queue | PoolClass::Null => {
                options.pool_size.unwrap_or(DEFAULT_POOL_SIZE).max(1)
            }
        };
        Self {
            max_size,
            connection_timeout: options
                .connect_timeout_secs
                .map_or(DEFAULT_CONNECT_TIMEOUT, Duration::from_secs),
            idle_timeout: options.idle_timeout_secs.map(Duration::from_secs),
            max_lifetime: options.max_lifetime_secs.map(Duration::from_secs),
            test_on_checkout: options.test_on_checkout.unwrap_or(false),
        }
    }

    /// Build a pool without opening connections. A reaper task is only spawned (and a Tokio
    /// runtime only required) when idle timeouts or lifetimes are configured.
    fn build<M: ManageConnection>(&self, manager: M) -> Pool<M> {
        Pool::builder()
            .max_size(self.max_size)
            .connection_timeout(self.connection_timeout)
            .idle_timeout(self.idle_timeout)
            .max_lifetime(self.max_lifetime)
            .test_on_check_out(self.test_on_checkout)
            .build_unchecked(manager)
    }
}

/// A bb8 pool that can be disposed and transparently rebuilt.
pub(crate) struct EnginePool<M: ManageConnection + Clone> {
    manager: M,
    settings: PoolSettings,
    current: RwLock<Pool<M>>,
}

impl<M: ManageConnection + Clone> EnginePool<M> {
    pub(crate) fn new(manager: M, settings: PoolSettings) -> Self {
        let pool = settings.build(manager.clone());
        Self {
            manager,
            settings,
            current: RwLock::new(pool),
        }
    }

    pub(crate) fn current(&self) -> Pool<M> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the pool with an empty one. Idle connections close when the old pool drops;
    /// checked-out connections close when they are returned.
    pub(crate) fn dispose(&self) {
        let fresh = self.settings.build(self.manager.clone());
        let old = std::mem::replace(
            &mut *self.current.write().unwrap_or_else(PoisonError::into_inner),
            fresh,
        );
        let state = old.state();
        debug!(
            connections = state.connections,
            idle = state.idle_connections,
            "disposed connection pool"
        );
    }

    pub(crate) fn status(&self) -> PoolStatus {
        let state = self.current().state();
        PoolStatus {
            connections: state.connections,
            idle_connections: state.idle_connections,
            checked_out: state.connections.saturating_sub(state.idle_connections),
            max_size: self.settings.max_size,
        }
    }
}
