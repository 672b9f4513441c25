use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::engine::Bind;
use crate::error::{BoxError, SqlComponentError};
use crate::session::AnySessionFactory;
use crate::url::UrlSource;

/// Default worker count for the commit executor.
pub const DEFAULT_COMMIT_EXECUTOR_WORKERS: usize = 50;

/// Connection pool flavour used by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum PoolClass {
    /// Bounded pool that keeps idle connections around.
    Queue,
    /// A single shared connection; the default for in-memory SQLite databases.
    Singleton,
    /// Connections are closed when released instead of being kept idle.
    Null,
}

impl FromStr for PoolClass {
    type Err = SqlComponentError;

    /// Accepts plain names (`queue`, `singleton`, `null`) as well as qualified pool class
    /// references such as `pools.builtin:NullPool`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.rsplit([':', '.']).next().unwrap_or(s).to_ascii_lowercase();
        match name.as_str() {
            "queue" | "queuepool" | "asyncadaptedqueuepool" => Ok(PoolClass::Queue),
            "singleton" | "singletonthreadpool" | "static" | "staticpool" => {
                Ok(PoolClass::Singleton)
            }
            "null" | "nullpool" => Ok(PoolClass::Null),
            _ => Err(SqlComponentError::ConfigError(format!(
                "unknown pool class: {s}"
            ))),
        }
    }
}

impl TryFrom<String> for PoolClass {
    type Error = SqlComponentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Options forwarded to engine construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineOptions {
    /// Maximum pooled connections (default 5; forced to 1 for singleton pools).
    pub pool_size: Option<u32>,
    /// Seconds to wait for a pooled connection (default 30).
    pub connect_timeout_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub max_lifetime_secs: Option<u64>,
    /// Validate connections with a round trip on checkout.
    pub test_on_checkout: Option<bool>,
    /// SQLite: allow one physical connection to be used from several threads. Forced on when
    /// unset, since commits run on the commit executor's threads.
    pub cross_thread: Option<bool>,
    /// SQLite: statements run on every new physical connection.
    pub pragmas: Vec<String>,
}

impl EngineOptions {
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = Some(pool_size);
        self
    }

    #[must_use]
    pub fn with_connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn with_cross_thread(mut self, cross_thread: bool) -> Self {
        self.cross_thread = Some(cross_thread);
        self
    }

    #[must_use]
    pub fn with_test_on_checkout(mut self, test: bool) -> Self {
        self.test_on_checkout = Some(test);
        self
    }

    #[must_use]
    pub fn with_pragma(mut self, pragma: impl Into<String>) -> Self {
        self.pragmas.push(pragma.into());
        self
    }
}

/// Options applied to every session produced by a factory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionOptions {
    /// Always reset to `false` by the session factory.
    pub expire_on_commit: bool,
    /// Begin a transaction on the first statement.
    pub autobegin: bool,
    /// Run statements queued with `add` before queries.
    pub autoflush: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            expire_on_commit: false,
            autobegin: true,
            autoflush: true,
        }
    }
}

impl SessionOptions {
    #[must_use]
    pub fn with_autobegin(mut self, autobegin: bool) -> Self {
        self.autobegin = autobegin;
        self
    }

    #[must_use]
    pub fn with_autoflush(mut self, autoflush: bool) -> Self {
        self.autoflush = autoflush;
        self
    }
}

/// Called with the resolved bind and session factory right before a component publishes its
/// resources.
#[async_trait]
pub trait ReadyCallback: Send + Sync {
    async fn on_ready(&self, bind: &Bind, factory: &AnySessionFactory) -> Result<(), BoxError>;
}

struct ReadyFn<F>(F);

#[async_trait]
impl<F> ReadyCallback for ReadyFn<F>
where
    F: Fn(&Bind, &AnySessionFactory) -> Result<(), BoxError> + Send + Sync,
{
    async fn on_ready(&self, bind: &Bind, factory: &AnySessionFactory) -> Result<(), BoxError> {
        (self.0)(bind, factory)
    }
}

struct ReadyAsyncFn<F>(F);

#[async_trait]
impl<F, Fut> ReadyCallback for ReadyAsyncFn<F>
where
    F: Fn(Bind, AnySessionFactory) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn on_ready(&self, bind: &Bind, factory: &AnySessionFactory) -> Result<(), BoxError> {
        (self.0)(bind.clone(), factory.clone()).await
    }
}

/// Configuration for a [`crate::SqlComponent`].
///
/// Exactly one of `url` and `bind` must be set. Everything but `bind` and `ready_callback`
/// can be loaded with serde:
/// ```rust
/// use sql_component::SqlComponentConfig;
///
/// let config: SqlComponentConfig = serde_json::from_str(
///     r#"{"url": "sqlite:///app.db", "poolclass": "NullPool", "resource_name": "main"}"#,
/// )
/// .unwrap();
/// assert!(config.prefer_async);
/// ```
#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SqlComponentConfig {
    pub url: Option<UrlSource>,
    #[serde(skip)]
    pub bind: Option<Bind>,
    /// Build an async engine when the driver supports both modes.
    pub prefer_async: bool,
    pub engine_options: EngineOptions,
    pub session_options: SessionOptions,
    /// Worker threads for blocking commits and rollbacks (sync engines only).
    pub commit_executor_workers: usize,
    #[serde(skip)]
    pub ready_callback: Option<Arc<dyn ReadyCallback>>,
    pub poolclass: Option<PoolClass>,
    /// Name under which every resource of the component is published.
    pub resource_name: String,
}

impl Default for SqlComponentConfig {
    fn default() -> Self {
        Self {
            url: None,
            bind: None,
            prefer_async: true,
            engine_options: EngineOptions::default(),
            session_options: SessionOptions::default(),
            commit_executor_workers: DEFAULT_COMMIT_EXECUTOR_WORKERS,
            ready_callback: None,
            poolclass: None,
            resource_name: "default".to_string(),
        }
    }
}

impl fmt::Debug for SqlComponentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlComponentConfig")
            .field("url", &self.url)
            .field("bind", &self.bind)
            .field("prefer_async", &self.prefer_async)
            .field("engine_options", &self.engine_options)
            .field("session_options", &self.session_options)
            .field("commit_executor_workers", &self.commit_executor_workers)
            .field("ready_callback", &self.ready_callback.is_some())
            .field("poolclass", &self.poolclass)
            .field("resource_name", &self.resource_name)
            .finish()
    }
}

impl SqlComponentConfig {
    #[must_use]
    pub fn from_url(url: impl Into<UrlSource>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn from_bind(bind: impl Into<Bind>) -> Self {
        Self {
            bind: Some(bind.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_prefer_async(mut self, prefer_async: bool) -> Self {
        self.prefer_async = prefer_async;
        self
    }

    #[must_use]
    pub fn with_engine_options(mut self, options: EngineOptions) -> Self {
        self.engine_options = options;
        self
    }

    #[must_use]
    pub fn with_session_options(mut self, options: SessionOptions) -> Self {
        self.session_options = options;
        self
    }

    #[must_use]
    pub fn with_commit_executor_workers(mut self, workers: usize) -> Self {
        self.commit_executor_workers = workers;
        self
    }

    #[must_use]
    pub fn with_poolclass(mut self, poolclass: PoolClass) -> Self {
        self.poolclass = Some(poolclass);
        self
    }

    #[must_use]
    pub fn with_resource_name(mut self, name: impl Into<String>) -> Self {
        self.resource_name = name.into();
        self
    }

    /// Synchronous ready callback.
    #[must_use]
    pub fn with_ready_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Bind, &AnySessionFactory) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.ready_callback = Some(Arc::new(ReadyFn(callback)));
        self
    }

    /// Ready callback whose future is awaited before resources are published.
    #[must_use]
    pub fn with_async_ready_callback<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(Bind, AnySessionFactory) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.ready_callback = Some(Arc::new(ReadyAsyncFn(callback)));
        self
    }

    #[must_use]
    pub fn with_ready_callback_impl(mut self, callback: Arc<dyn ReadyCallback>) -> Self {
        self.ready_callback = Some(callback);
        self
    }
}
