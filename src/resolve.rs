use tracing::debug;

use crate::config::{EngineOptions, PoolClass};
use crate::engine::{AsyncEngine, Bind, SyncEngine};
use crate::error::SqlComponentError;
use crate::url::{DatabaseUrl, Dialect, ExecutionMode, UrlSource};
use crate::utils::apply_sqlite_hacks;

fn build_engine(
    url: &DatabaseUrl,
    options: &EngineOptions,
    poolclass: Option<PoolClass>,
    mode: ExecutionMode,
) -> Result<Bind, SqlComponentError> {
    Ok(match mode {
        ExecutionMode::Sync => SyncEngine::new(url.clone(), options, poolclass)?.into(),
        ExecutionMode::Async => AsyncEngine::new(url.clone(), options, poolclass)?.into(),
    })
}

/// Turn the configured URL or bind into the single bind a component runs against.
///
/// A supplied bind is returned as is. A URL builds a new engine in the preferred mode,
/// falling back to the other mode when the driver cannot run in the preferred one. New
/// `SQLite` engines get cross-thread connections (unless configured otherwise) and the
/// transaction-framing hooks of [`apply_sqlite_hacks`].
///
/// # Errors
/// Returns `SqlComponentError::ConfigError` unless exactly one of `url` and `bind` is given,
/// or when the URL is malformed; engine construction errors are returned unchanged.
pub fn resolve_bind(
    url: Option<&UrlSource>,
    bind: Option<&Bind>,
    engine_options: &EngineOptions,
    prefer_async: bool,
    poolclass: Option<PoolClass>,
) -> Result<Bind, SqlComponentError> {
    let url = match (url, bind) {
        (Some(_), Some(_)) => {
            return Err(SqlComponentError::ConfigError(
                "specify either url or bind, not both".into(),
            ));
        }
        (None, None) => {
            return Err(SqlComponentError::ConfigError(
                "specify either url or bind".into(),
            ));
        }
        (None, Some(bind)) => return Ok(bind.clone()),
        (Some(url), None) => url.to_database_url()?,
    };

    let mut options = engine_options.clone();
    if url.dialect == Dialect::Sqlite && options.cross_thread.is_none() {
        options.cross_thread = Some(true);
    }

    let (preferred, fallback) = if prefer_async {
        (ExecutionMode::Async, ExecutionMode::Sync)
    } else {
        (ExecutionMode::Sync, ExecutionMode::Async)
    };
    let bind = match build_engine(&url, &options, poolclass, preferred) {
        Err(e) if e.is_unsupported_mode() => {
            debug!(url = %url, %preferred, %fallback, "driver does not support preferred mode");
            build_engine(&url, &options, poolclass, fallback)?
        }
        other => other?,
    };

    if url.dialect == Dialect::Sqlite {
        apply_sqlite_hacks(&bind)?;
    }
    Ok(bind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ConnectHook, TxFraming};

    #[test]
    fn requires_exactly_one_source() {
        let options = EngineOptions::default();
        let err = resolve_bind(None, None, &options, true, None).unwrap_err();
        assert!(matches!(err, SqlComponentError::ConfigError(_)));
    }

    #[tokio::test]
    async fn sqlite_engines_get_framing_hooks() {
        let url = UrlSource::from("sqlite:///:memory:");
        let bind = resolve_bind(Some(&url), None, &EngineOptions::default(), false, None).unwrap();
        assert!(!bind.is_async());
        assert_eq!(
            bind.events().connect_hooks(),
            vec![ConnectHook::SetFraming(TxFraming::Manual)]
        );
        assert_eq!(bind.events().begin_hooks().len(), 1);

        let both = resolve_bind(Some(&url), Some(&bind), &EngineOptions::default(), false, None)
            .unwrap_err();
        assert!(matches!(both, SqlComponentError::ConfigError(_)));
    }
}
