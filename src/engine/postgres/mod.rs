//! tokio-postgres-backed asynchronous connections.

pub mod params;
pub mod query;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bb8::ManageConnection;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use self::params::as_pg_params;
use self::query::build_result_set_from_rows;
use super::events::{BeginHook, ConnectHook, EngineEvents};
use super::framing::{TxFraming, TxTracker, is_dml};
use crate::error::SqlComponentError;
use crate::results::ResultSet;
use crate::types::RowValues;
use crate::url::DatabaseUrl;

/// Build a `tokio_postgres` config from a parsed URL.
///
/// # Errors
/// Returns `SqlComponentError::ConfigError` for query options that cannot be applied.
pub fn pg_config(url: &DatabaseUrl) -> Result<tokio_postgres::Config, SqlComponentError> {
    let mut config = tokio_postgres::Config::new();
    config.host(url.host.as_deref().unwrap_or("localhost"));
    if let Some(port) = url.port {
        config.port(port);
    }
    if let Some(user) = &url.username {
        config.user(user.as_str());
    }
    if let Some(password) = &url.password {
        config.password(password.as_str());
    }
    if let Some(database) = &url.database {
        config.dbname(database.as_str());
    }
    for (key, value) in &url.query {
        match key.as_str() {
            "application_name" => {
                config.application_name(value.as_str());
            }
            "options" => {
                config.options(value.as_str());
            }
            "connect_timeout" => {
                let secs: u64 = value.parse().map_err(|_| {
                    SqlComponentError::ConfigError(format!("invalid connect_timeout: {value}"))
                })?;
                config.connect_timeout(Duration::from_secs(secs));
            }
            other => debug!(option = other, "ignoring unsupported postgres url option"),
        }
    }
    Ok(config)
}

/// A `tokio_postgres` client with the transaction state the pool layer tracks for it.
pub struct PgRawConnection {
    client: Client,
    framing: TxFraming,
    tracker: TxTracker,
    broken: bool,
}

impl PgRawConnection {
    fn new(client: Client) -> Self {
        Self {
            client,
            framing: TxFraming::Explicit,
            tracker: TxTracker::default(),
            broken: false,
        }
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.tracker.in_transaction()
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Direct access to the client. Transaction statements issued through it are not tracked.
    pub fn client(&mut self) -> &mut Client {
        &mut self.client
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
        self.client.batch_execute(sql).await?;
        self.tracker.observe(sql);
        Ok(())
    }

    async fn frame_statement(&mut self, sql: &str) -> Result<(), SqlComponentError> {
        if self.framing == TxFraming::Implicit && !self.tracker.in_transaction() && is_dml(sql) {
            self.run_batch("BEGIN").await?;
        }
        Ok(())
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
        let affected = self.client.execute(sql, &as_pg_params(params)).await?;
        self.tracker.observe(sql);
        Ok(usize::try_from(affected).unwrap_or(usize::MAX))
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
        let stmt = self.client.prepare(sql).await?;
        let rows = self.client.query(&stmt, &as_pg_params(params)).await?;
        self.tracker.observe(sql);
        build_result_set_from_rows(stmt.columns(), &rows)
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

impl fmt::Debug for PgRawConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgRawConnection")
            .field("framing", &self.framing)
            .field("in_transaction", &self.tracker.in_transaction())
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

/// bb8 manager for Postgres clients.
#[derive(Clone)]
pub struct PgManager {
    config: tokio_postgres::Config,
    events: Arc<EngineEvents>,
    discard_on_release: bool,
}

impl PgManager {
    pub(crate) fn new(
        config: tokio_postgres::Config,
        events: Arc<EngineEvents>,
        discard_on_release: bool,
    ) -> Self {
        Self {
            config,
            events,
            discard_on_release,
        }
    }
}

impl ManageConnection for PgManager {
    type Connection = PgRawConnection;
    type Error = SqlComponentError;

    #[allow(clippy::manual_async_fn)]
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send {
        let cfg = self.config.clone();
        let events = Arc::clone(&self.events);
        async move {
            debug!(
                hosts = ?cfg.get_hosts(),
                db = ?cfg.get_dbname(),
                user = ?cfg.get_user(),
                "postgres connect start"
            );
            let (client, connection) = cfg.connect(NoTls).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!(error = %e, "postgres connection task ended with an error");
                }
            });
            let mut raw = PgRawConnection::new(client);
            raw.apply_connect_hooks(&events.connect_hooks()).await?;
            Ok(raw)
        }
    }

    #[allow(clippy::manual_async_fn)]
    fn is_valid(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async move {
            conn.client.simple_query("SELECT 1").await?;
            Ok(())
        }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        self.discard_on_release || conn.broken || conn.client.is_closed()
    }
}
