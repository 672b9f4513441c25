//! Database URLs: `dialect[+driver]://[user[:password]@]host[:port]/database[?key=value]`.
//!
//! SQLite URLs follow the usual file conventions: `sqlite:///relative.db`,
//! `sqlite:////absolute/path.db`, and `sqlite://` or `sqlite:///:memory:` for an in-memory
//! database.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use url::Url;

use crate::error::SqlComponentError;

/// Whether an engine runs blocking driver calls or async ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    Sync,
    Async,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Sync => f.write_str("synchronous"),
            ExecutionMode::Async => f.write_str("asynchronous"),
        }
    }
}

/// SQL dialect named by the URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Sqlite,
    Postgresql,
}

impl Dialect {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgresql => "postgresql",
        }
    }

    fn parse(name: &str) -> Result<Self, SqlComponentError> {
        match name.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Dialect::Sqlite),
            "postgresql" | "postgres" => Ok(Dialect::Postgresql),
            other => Err(SqlComponentError::ConfigError(format!(
                "unknown database dialect: {other}"
            ))),
        }
    }
}

/// Driver crate used to talk to the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Driver {
    /// Blocking `rusqlite`.
    Rusqlite,
    /// Async `sqlx` SQLite connections.
    Sqlx,
    /// Async `tokio-postgres`.
    TokioPostgres,
}

impl Driver {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Driver::Rusqlite => "rusqlite",
            Driver::Sqlx => "sqlx",
            Driver::TokioPostgres => "tokio_postgres",
        }
    }

    #[must_use]
    pub fn dialect(self) -> Dialect {
        match self {
            Driver::Rusqlite | Driver::Sqlx => Dialect::Sqlite,
            Driver::TokioPostgres => Dialect::Postgresql,
        }
    }

    #[must_use]
    pub fn mode(self) -> ExecutionMode {
        match self {
            Driver::Rusqlite => ExecutionMode::Sync,
            Driver::Sqlx | Driver::TokioPostgres => ExecutionMode::Async,
        }
    }

    fn parse(dialect: Dialect, name: &str) -> Result<Self, SqlComponentError> {
        let driver = match name.to_ascii_lowercase().as_str() {
            "rusqlite" => Driver::Rusqlite,
            "sqlx" => Driver::Sqlx,
            "tokio_postgres" | "tokio-postgres" => Driver::TokioPostgres,
            other => {
                return Err(SqlComponentError::ConfigError(format!(
                    "unknown database driver: {other}"
                )));
            }
        };
        if driver.dialect() != dialect {
            return Err(SqlComponentError::ConfigError(format!(
                "driver {} cannot be used with dialect {}",
                driver.name(),
                dialect.name()
            )));
        }
        Ok(driver)
    }
}

/// A parsed database URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseUrl {
    pub dialect: Dialect,
    /// Explicit driver; `None` lets the engine pick one for the requested mode.
    pub driver: Option<Driver>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Database name, or the file path for SQLite.
    pub database: Option<String>,
    pub query: BTreeMap<String, String>,
}

impl DatabaseUrl {
    /// Start a URL for the given dialect with every other field empty.
    #[must_use]
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            driver: None,
            username: None,
            password: None,
            host: None,
            port: None,
            database: None,
            query: BTreeMap::new(),
        }
    }

    /// Parse a URL string.
    ///
    /// # Errors
    /// Returns `SqlComponentError::ConfigError` for malformed URLs or unknown dialects/drivers.
    pub fn parse(raw: &str) -> Result<Self, SqlComponentError> {
        let (scheme, rest) = raw.split_once("://").ok_or_else(|| {
            SqlComponentError::ConfigError(format!("invalid database URL (missing scheme): {raw}"))
        })?;
        let mut url = Self::from_drivername(scheme)?;
        if url.dialect == Dialect::Sqlite {
            url.fill_sqlite(rest)?;
        } else {
            url.fill_network(rest)?;
        }
        Ok(url)
    }

    /// Build a URL from a mapping of fields (`drivername`, `username`, `password`, `host`,
    /// `port`, `database`, `query`).
    ///
    /// # Errors
    /// Returns `SqlComponentError::ConfigError` for missing `drivername`, unknown keys or
    /// values of the wrong type.
    pub fn from_fields(fields: &BTreeMap<String, JsonValue>) -> Result<Self, SqlComponentError> {
        let drivername = fields
            .get("drivername")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| {
                SqlComponentError::ConfigError("URL fields require a \"drivername\" string".into())
            })?;
        let mut url = Self::from_drivername(drivername)?;

        for (key, value) in fields {
            match key.as_str() {
                "drivername" => {}
                "username" => url.username = optional_string(key, value)?,
                "password" => url.password = optional_string(key, value)?,
                "host" => url.host = optional_string(key, value)?,
                "database" => url.database = optional_string(key, value)?,
                "port" => url.port = optional_port(value)?,
                "query" => url.query = query_map(value)?,
                other => {
                    return Err(SqlComponentError::ConfigError(format!(
                        "unknown URL field: {other}"
                    )));
                }
            }
        }
        Ok(url)
    }

    fn from_drivername(drivername: &str) -> Result<Self, SqlComponentError> {
        let (dialect, driver) = match drivername.split_once('+') {
            Some((dialect, driver)) => (dialect, Some(driver)),
            None => (drivername, None),
        };
        let dialect = Dialect::parse(dialect)?;
        let mut url = Self::new(dialect);
        url.driver = driver.map(|d| Driver::parse(dialect, d)).transpose()?;
        Ok(url)
    }

    fn fill_sqlite(&mut self, rest: &str) -> Result<(), SqlComponentError> {
        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };
        let path = match location.split_once('/') {
            Some(("", path)) => path,
            None if location.is_empty() => "",
            _ => {
                return Err(SqlComponentError::ConfigError(format!(
                    "SQLite URLs do not take a host: sqlite://{rest}"
                )));
            }
        };
        self.database = (!path.is_empty()).then(|| path.to_string());
        if let Some(query) = query {
            self.query = url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect();
        }
        Ok(())
    }

    fn fill_network(&mut self, rest: &str) -> Result<(), SqlComponentError> {
        // `+driver` suffixes may carry characters a URL scheme cannot.
        let parsed = Url::parse(&format!("{}://{rest}", self.dialect.name()))
            .map_err(|e| SqlComponentError::ConfigError(format!("invalid database URL: {e}")))?;
        self.username = Some(parsed.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        self.password = parsed.password().map(str::to_string);
        self.host = parsed.host_str().map(str::to_string);
        self.port = parsed.port();
        self.database = Some(parsed.path().trim_start_matches('/'))
            .filter(|db| !db.is_empty())
            .map(str::to_string);
        self.query = parsed.query_pairs().into_owned().collect();
        Ok(())
    }

    /// `dialect` or `dialect+driver`.
    #[must_use]
    pub fn drivername(&self) -> String {
        match self.driver {
            Some(driver) => format!("{}+{}", self.dialect.name(), driver.name()),
            None => self.dialect.name().to_string(),
        }
    }

    /// Pick the driver for `mode`.
    ///
    /// # Errors
    /// Returns `SqlComponentError::UnsupportedMode` when the URL names a driver that cannot run
    /// in `mode`, or the dialect has no driver for it.
    pub fn driver_for(&self, mode: ExecutionMode) -> Result<Driver, SqlComponentError> {
        let driver = match (self.driver, self.dialect, mode) {
            (Some(driver), _, _) => driver,
            (None, Dialect::Sqlite, ExecutionMode::Sync) => Driver::Rusqlite,
            (None, Dialect::Sqlite, ExecutionMode::Async) => Driver::Sqlx,
            (None, Dialect::Postgresql, _) => Driver::TokioPostgres,
        };
        if driver.mode() == mode {
            Ok(driver)
        } else {
            Err(SqlComponentError::UnsupportedMode {
                driver: self.drivername(),
                mode: mode.to_string(),
            })
        }
    }

    /// True for SQLite databases that live only in memory.
    #[must_use]
    pub fn is_memory(&self) -> bool {
        self.dialect == Dialect::Sqlite
            && matches!(self.database.as_deref(), None | Some("" | ":memory:"))
    }

    /// SQLite file path (`:memory:` for in-memory databases).
    #[must_use]
    pub fn sqlite_path(&self) -> String {
        if self.is_memory() {
            ":memory:".to_string()
        } else {
            self.database.clone().unwrap_or_default()
        }
    }

    #[must_use]
    pub fn with_driver(mut self, driver: Driver) -> Self {
        self.driver = Some(driver);
        self
    }

    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }
}

impl FromStr for DatabaseUrl {
    type Err = SqlComponentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DatabaseUrl::parse(s)
    }
}

impl fmt::Display for DatabaseUrl {
    /// Renders the URL with the password masked.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.drivername())?;
        if let Some(user) = &self.username {
            f.write_str(user)?;
            if self.password.is_some() {
                f.write_str(":***")?;
            }
            f.write_str("@")?;
        }
        if let Some(host) = &self.host {
            f.write_str(host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        if let Some(database) = &self.database {
            write!(f, "/{database}")?;
        }
        Ok(())
    }
}

/// Where a component gets its database URL from.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UrlSource {
    /// A URL string.
    Text(String),
    /// A mapping of URL fields, see [`DatabaseUrl::from_fields`].
    Fields(BTreeMap<String, JsonValue>),
    /// An already parsed URL.
    #[serde(skip_deserializing)]
    Url(DatabaseUrl),
}

impl UrlSource {
    /// Normalise into a [`DatabaseUrl`].
    ///
    /// # Errors
    /// Returns `SqlComponentError::ConfigError` when the URL cannot be parsed.
    pub fn to_database_url(&self) -> Result<DatabaseUrl, SqlComponentError> {
        match self {
            UrlSource::Text(raw) => DatabaseUrl::parse(raw),
            UrlSource::Fields(fields) => DatabaseUrl::from_fields(fields),
            UrlSource::Url(url) => Ok(url.clone()),
        }
    }
}

impl From<&str> for UrlSource {
    fn from(value: &str) -> Self {
        UrlSource::Text(value.to_string())
    }
}

impl From<String> for UrlSource {
    fn from(value: String) -> Self {
        UrlSource::Text(value)
    }
}

impl From<DatabaseUrl> for UrlSource {
    fn from(value: DatabaseUrl) -> Self {
        UrlSource::Url(value)
    }
}

impl From<BTreeMap<String, JsonValue>> for UrlSource {
    fn from(value: BTreeMap<String, JsonValue>) -> Self {
        UrlSource::Fields(value)
    }
}

fn optional_string(key: &str, value: &JsonValue) -> Result<Option<String>, SqlComponentError> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::String(s) => Ok(Some(s.clone())),
        other => Err(SqlComponentError::ConfigError(format!(
            "URL field {key} must be a string, got {other}"
        ))),
    }
}

fn optional_port(value: &JsonValue) -> Result<Option<u16>, SqlComponentError> {
    let port = match value {
        JsonValue::Null => return Ok(None),
        JsonValue::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        JsonValue::String(s) => s.parse::<u16>().ok(),
        _ => None,
    };
    port.map(Some)
        .ok_or_else(|| SqlComponentError::ConfigError(format!("invalid port: {value}")))
}

fn query_map(value: &JsonValue) -> Result<BTreeMap<String, String>, SqlComponentError> {
    let JsonValue::Object(map) = value else {
        return Err(SqlComponentError::ConfigError(
            "URL field query must be a mapping".into(),
        ));
    };
    Ok(map
        .iter()
        .map(|(k, v)| {
            let value = v.as_str().map_or_else(|| v.to_string(), str::to_string);
            (k.clone(), value)
        })
        .collect())
}
