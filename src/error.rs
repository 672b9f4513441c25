use thiserror::Error;

/// Boxed error returned by user callbacks (ready callbacks, teardown callbacks).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum SqlComponentError {
    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    #[error(transparent)]
    SqlxError(#[from] sqlx::Error),

    #[error(transparent)]
    PostgresError(#[from] tokio_postgres::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Driver {driver} does not support {mode} execution")]
    UnsupportedMode { driver: String, mode: String },

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("SQL execution error: {0}")]
    ExecutionError(String),

    #[error("Resource error: {0}")]
    ResourceError(String),

    #[error("Lifecycle error: {0}")]
    LifecycleError(String),

    #[error("Commit executor error: {0}")]
    ExecutorError(String),

    #[error("Callback failed: {0}")]
    Callback(#[source] BoxError),

    #[error("{} teardown callbacks failed: {}", .0.len(), join_messages(.0))]
    Teardown(Vec<SqlComponentError>),

    #[error("Other database error: {0}")]
    Other(String),
}

impl SqlComponentError {
    /// True for the error raised when a driver cannot run in the requested mode.
    #[must_use]
    pub fn is_unsupported_mode(&self) -> bool {
        matches!(self, SqlComponentError::UnsupportedMode { .. })
    }
}

impl From<bb8::RunError<SqlComponentError>> for SqlComponentError {
    fn from(err: bb8::RunError<SqlComponentError>) -> Self {
        match err {
            bb8::RunError::User(inner) => inner,
            bb8::RunError::TimedOut => {
                SqlComponentError::ConnectionError("timed out waiting for a pooled connection".into())
            }
        }
    }
}

fn join_messages(errors: &[SqlComponentError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
