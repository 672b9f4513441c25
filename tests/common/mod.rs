#![allow(dead_code)]

use std::path::PathBuf;

use serde_json::json;
use sql_component::{RowValues, SqlComponentError, UrlSource};
use tempfile::TempDir;

/// A fresh database file path inside a directory removed when the guard drops.
pub fn unique_db_path() -> Result<(TempDir, PathBuf), std::io::Error> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.db");
    Ok((dir, path))
}

/// URL in mapping form for a SQLite file.
pub fn sqlite_file_url(path: &std::path::Path) -> UrlSource {
    serde_json::from_value(json!({
        "drivername": "sqlite",
        "database": path.display().to_string(),
    }))
    .expect("valid url mapping")
}

/// Read the first column of the first row as an integer.
pub fn scalar_int(rs: &sql_component::ResultSet) -> Result<i64, SqlComponentError> {
    rs.scalar()
        .and_then(RowValues::as_int)
        .copied()
        .ok_or_else(|| SqlComponentError::Other("expected an integer scalar".into()))
}
