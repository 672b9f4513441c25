mod common;

use std::error::Error;

use common::scalar_int;
use sql_component::prelude::*;
use sql_component::{DatabaseUrl, SyncConnection, apply_sqlite_hacks};

async fn memory_connection(hacks: bool) -> Result<SyncConnection, Box<dyn Error>> {
    let url = DatabaseUrl::parse("sqlite:///:memory:")?;
    let engine = SyncEngine::new(url, &EngineOptions::default(), None)?;
    if hacks {
        apply_sqlite_hacks(&engine.clone().into())?;
    }
    let conn = engine.connect().await?;
    conn.execute_batch("CREATE TABLE foo (id INTEGER PRIMARY KEY)").await?;
    Ok(conn)
}

/// begin, savepoint, insert, release, roll back the outer transaction
async fn rows_after_outer_rollback(conn: &SyncConnection) -> Result<i64, Box<dyn Error>> {
    conn.begin().await?;
    conn.savepoint("sp1").await?;
    conn.execute("INSERT INTO foo (id) VALUES (1)", &[]).await?;
    conn.release_savepoint("sp1").await?;
    conn.rollback().await?;
    let rs = conn.query("SELECT count(*) FROM foo", &[]).await?;
    Ok(scalar_int(&rs)?)
}

#[tokio::test]
async fn released_savepoint_commits_without_hooks() -> Result<(), Box<dyn Error>> {
    let conn = memory_connection(false).await?;
    // the savepoint became the outermost transaction, so releasing it committed the row
    assert_eq!(rows_after_outer_rollback(&conn).await?, 1);
    Ok(())
}

#[tokio::test]
async fn hooks_keep_savepoints_nested() -> Result<(), Box<dyn Error>> {
    let conn = memory_connection(true).await?;
    assert_eq!(rows_after_outer_rollback(&conn).await?, 0);
    Ok(())
}

#[test]
fn hooks_reject_other_dialects() -> Result<(), Box<dyn Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let url = DatabaseUrl::parse("postgresql://app@localhost/app")?;
        let engine = AsyncEngine::new(url, &EngineOptions::default(), None)?;
        let err = apply_sqlite_hacks(&engine.into()).unwrap_err();
        assert!(matches!(err, SqlComponentError::ConfigError(_)));
        Ok::<(), SqlComponentError>(())
    })?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_savepoints_roll_back_independently() -> Result<(), Box<dyn Error>> {
    let component = SqlComponent::new(
        SqlComponentConfig::from_url("sqlite:///:memory:").with_prefer_async(false),
    )?;
    let ctx = Context::new();
    component.start(&ctx).await?;
    let session: Session = ctx.require_resource("default")?;
    session
        .execute_batch("CREATE TABLE foo (id INTEGER PRIMARY KEY)")
        .await?;

    session.execute("INSERT INTO foo (id) VALUES (1)", &[]).await?;
    session.begin_nested().await?;
    session.execute("INSERT INTO foo (id) VALUES (2)", &[]).await?;
    session.rollback_nested().await?;
    session.begin_nested().await?;
    session.execute("INSERT INTO foo (id) VALUES (3)", &[]).await?;
    session.commit_nested().await?;
    session.commit().await?;

    let rs = session.query("SELECT id FROM foo ORDER BY id", &[]).await?;
    let ids: Vec<i64> = rs
        .results
        .iter()
        .filter_map(|row| row.get_by_index(0).and_then(RowValues::as_int).copied())
        .collect();
    assert_eq!(ids, vec![1, 3]);

    let err = session.commit_nested().await.unwrap_err();
    assert!(matches!(err, SqlComponentError::ExecutionError(_)));
    ctx.close(None).await?;
    Ok(())
}

#[tokio::test]
async fn async_session_savepoints_roll_back_independently() -> Result<(), Box<dyn Error>> {
    let component = SqlComponent::new(SqlComponentConfig::from_url("sqlite:///:memory:"))?;
    let ctx = Context::new();
    component.start(&ctx).await?;
    let session: AsyncSession = ctx.require_resource("default")?;
    session
        .execute_batch("CREATE TABLE foo (id INTEGER PRIMARY KEY)")
        .await?;

    session.execute("INSERT INTO foo (id) VALUES (1)", &[]).await?;
    session.begin_nested().await?;
    session.execute("INSERT INTO foo (id) VALUES (2)", &[]).await?;
    session.rollback_nested().await?;
    session.commit().await?;

    let rs = session.query("SELECT count(*) FROM foo", &[]).await?;
    assert_eq!(scalar_int(&rs)?, 1);
    ctx.close(None).await?;
    Ok(())
}
