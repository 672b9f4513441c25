//! Helpers for tests and setup code.

use crate::engine::{AsyncBind, AsyncPooled, BeginHook, Bind, ConnectHook, SyncBind, TxFraming};
use crate::error::SqlComponentError;
use crate::types::RowValues;
use crate::url::Dialect;

/// Make `SAVEPOINT`s nest properly on `SQLite`.
///
/// New connections stop framing transactions implicitly and every root transaction starts
/// with an explicit `BEGIN`. The hooks are installed on the engine behind `bind`, so only
/// connections opened afterwards are affected. Components call this for engines they create;
/// call it yourself before checking out a connection you intend to pass in as a bind.
///
/// # Errors
/// Returns `SqlComponentError::ConfigError` for non-`SQLite` engines.
pub fn apply_sqlite_hacks(bind: &Bind) -> Result<(), SqlComponentError> {
    if bind.dialect() != Dialect::Sqlite {
        return Err(SqlComponentError::ConfigError(format!(
            "apply_sqlite_hacks() only works with sqlite engines, not {}",
            bind.dialect().name()
        )));
    }
    let events = bind.events();
    events.listen_connect(ConnectHook::SetFraming(TxFraming::Manual));
    events.listen_begin(BeginHook::Execute("BEGIN".into()));
    Ok(())
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn sqlite_drop_statements(kind_and_names: &[(String, String)], schema: Option<&str>) -> Vec<String> {
    let prefix = schema.map(|s| format!("{}.", quote_ident(s))).unwrap_or_default();
    let mut views = Vec::new();
    let mut tables = Vec::new();
    for (kind, name) in kind_and_names {
        let target = format!("{prefix}{}", quote_ident(name));
        match kind.as_str() {
            "view" => views.push(format!("DROP VIEW IF EXISTS {target}")),
            _ => tables.push(format!("DROP TABLE IF EXISTS {target}")),
        }
    }
    views.extend(tables);
    views
}

fn sqlite_catalog_query(schema: Option<&str>) -> String {
    let master = match schema {
        Some(schema) => format!("{}.sqlite_master", quote_ident(schema)),
        None => "sqlite_master".to_string(),
    };
    format!(
        "SELECT type, name FROM {master} \
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'"
    )
}

fn kind_and_names(rs: &crate::results::ResultSet) -> Vec<(String, String)> {
    rs.results
        .iter()
        .filter_map(|row| {
            let kind = row.get_by_index(0).and_then(RowValues::as_text)?;
            let name = row.get_by_index(1).and_then(RowValues::as_text)?;
            Some((kind.to_owned(), name.to_owned()))
        })
        .collect()
}

/// Drop every table and view in the default schema and in `schemas`.
///
/// For `SQLite`, `schemas` names attached databases.
///
/// # Errors
/// Returns `SqlComponentError` if reading the catalog or dropping an object fails.
pub async fn clear_database(bind: &SyncBind, schemas: &[&str]) -> Result<(), SqlComponentError> {
    let conn = match bind {
        SyncBind::Engine(engine) => engine.connect().await?,
        SyncBind::Connection(conn) => conn.clone(),
    };
    let all_schemas: Vec<Option<String>> = std::iter::once(None)
        .chain(schemas.iter().map(|s| Some((*s).to_owned())))
        .collect();
    conn.with_connection(move |raw| {
        let mut statements = Vec::new();
        for schema in &all_schemas {
            let rs = raw.query(&sqlite_catalog_query(schema.as_deref()), &[])?;
            statements.extend(sqlite_drop_statements(&kind_and_names(&rs), schema.as_deref()));
        }
        raw.connection().execute_batch("PRAGMA foreign_keys = OFF")?;
        for statement in &statements {
            raw.connection().execute_batch(statement)?;
        }
        raw.connection().execute_batch("PRAGMA foreign_keys = ON")?;
        Ok(())
    })
    .await
}

async fn postgres_objects(
    raw: &mut AsyncPooled,
    schemas: &[&str],
) -> Result<Vec<String>, SqlComponentError> {
    let current = raw.query("SELECT current_schema()", &[]).await?;
    let mut all_schemas: Vec<String> = current
        .scalar()
        .and_then(RowValues::as_text)
        .map(str::to_owned)
        .into_iter()
        .collect();
    all_schemas.extend(schemas.iter().map(|s| (*s).to_owned()));

    let mut views = Vec::new();
    let mut tables = Vec::new();
    for schema in &all_schemas {
        let rs = raw
            .query(
                "SELECT table_type::text, table_name::text FROM information_schema.tables \
                 WHERE table_schema::text = $1",
                &[RowValues::Text(schema.clone())],
            )
            .await?;
        for (kind, name) in kind_and_names(&rs) {
            let target = format!("{}.{}", quote_ident(schema), quote_ident(&name));
            if kind == "VIEW" {
                views.push(format!("DROP VIEW IF EXISTS {target} CASCADE"));
            } else {
                tables.push(format!("DROP TABLE IF EXISTS {target} CASCADE"));
            }
        }
    }
    views.extend(tables);
    Ok(views)
}

/// Drop every table and view in the default schema and in `schemas` over an async bind.
///
/// For `SQLite`, `schemas` names attached databases.
///
/// # Errors
/// Returns `SqlComponentError` if reading the catalog or dropping an object fails.
pub async fn clear_async_database(
    bind: &AsyncBind,
    schemas: &[&str],
) -> Result<(), SqlComponentError> {
    let conn = match bind {
        AsyncBind::Engine(engine) => engine.connect().await?,
        AsyncBind::Connection(conn) => conn.clone(),
    };
    let mut raw = conn.lock().await;
    match bind.engine().dialect() {
        Dialect::Postgresql => {
            for statement in postgres_objects(&mut raw, schemas).await? {
                raw.execute_batch(&statement).await?;
            }
        }
        Dialect::Sqlite => {
            let all_schemas = std::iter::once(None).chain(schemas.iter().copied().map(Some));
            let mut statements = Vec::new();
            for schema in all_schemas {
                let rs = raw.query(&sqlite_catalog_query(schema), &[]).await?;
                statements.extend(sqlite_drop_statements(&kind_and_names(&rs), schema));
            }
            raw.execute_batch("PRAGMA foreign_keys = OFF").await?;
            for statement in statements {
                raw.execute_batch(&statement).await?;
            }
            raw.execute_batch("PRAGMA foreign_keys = ON").await?;
        }
    }
    Ok(())
}
