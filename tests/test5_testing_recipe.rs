//! Application code runs against a connection wrapped in an outer transaction and savepoint,
//! so every test starts from the same data and leaves nothing behind.

mod common;

use std::error::Error;

use common::scalar_int;
use sql_component::prelude::*;
use sql_component::{AsyncConnection, DatabaseUrl, SyncConnection, apply_sqlite_hacks};

const SCHEMA: &str = "CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT NOT NULL)";

struct SyncFixture {
    conn: SyncConnection,
}

impl SyncFixture {
    async fn new() -> Result<Self, Box<dyn Error>> {
        let url = DatabaseUrl::parse("sqlite:///:memory:")?;
        let engine = SyncEngine::new(url, &EngineOptions::default().with_cross_thread(true), None)?;
        apply_sqlite_hacks(&engine.clone().into())?;
        let conn = engine.connect().await?;
        conn.execute_batch(SCHEMA).await?;

        conn.begin().await?;
        conn.savepoint("fixture").await?;
        conn.execute(
            "INSERT INTO people (name) VALUES (?1)",
            &[RowValues::Text("Test person".into())],
        )
        .await?;
        Ok(Self { conn })
    }

    fn component(&self) -> Result<SqlComponent, SqlComponentError> {
        SqlComponent::new(SqlComponentConfig::from_bind(self.conn.clone()))
    }

    async fn people(&self) -> Result<i64, Box<dyn Error>> {
        let rs = self.conn.query("SELECT count(*) FROM people", &[]).await?;
        Ok(scalar_int(&rs)?)
    }

    async fn teardown(self) -> Result<(), Box<dyn Error>> {
        self.conn.rollback_to_savepoint("fixture").await?;
        self.conn.rollback().await?;
        assert_eq!(self.people().await?, 0);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_add_person() -> Result<(), Box<dyn Error>> {
    let fixture = SyncFixture::new().await?;
    let root = Context::new();
    fixture.component()?.start(&root).await?;

    let ctx = root.child();
    let session: Session = ctx.require_resource("default")?;
    session.add(
        "INSERT INTO people (name) VALUES (?1)",
        vec![RowValues::Text("Another person".into())],
    );
    ctx.close(None).await?;
    root.close(None).await?;

    assert_eq!(fixture.people().await?, 2);
    fixture.teardown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_rollback_after_integrity_error() -> Result<(), Box<dyn Error>> {
    let fixture = SyncFixture::new().await?;
    let root = Context::new();
    fixture.component()?.start(&root).await?;

    let ctx = root.child();
    let session: Session = ctx.require_resource("default")?;
    let err = session
        .execute("INSERT INTO people (name) VALUES (?1)", &[RowValues::Null])
        .await
        .unwrap_err();
    assert!(matches!(err, SqlComponentError::SqliteError(_)));
    session.rollback().await?;
    // the next statement opens a fresh savepoint inside the fixture transaction
    session
        .execute(
            "INSERT INTO people (name) VALUES (?1)",
            &[RowValues::Text("Works now!".into())],
        )
        .await?;
    ctx.close(None).await?;
    root.close(None).await?;

    assert_eq!(fixture.people().await?, 2);
    assert!(fixture.conn.in_transaction().await);
    fixture.teardown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_delete_person() -> Result<(), Box<dyn Error>> {
    let fixture = SyncFixture::new().await?;
    let root = Context::new();
    fixture.component()?.start(&root).await?;

    let ctx = root.child();
    let session: Session = ctx.require_resource("default")?;
    session.execute("DELETE FROM people", &[]).await?;
    ctx.close(None).await?;
    root.close(None).await?;

    assert_eq!(fixture.people().await?, 0);
    fixture.teardown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_failed_scope_keeps_fixture_data() -> Result<(), Box<dyn Error>> {
    let fixture = SyncFixture::new().await?;
    let root = Context::new();
    fixture.component()?.start(&root).await?;

    let ctx = root.child();
    let session: Session = ctx.require_resource("default")?;
    session.execute("DELETE FROM people", &[]).await?;
    ctx.close(Some(ScopeError::msg("handler failed"))).await?;
    root.close(None).await?;

    assert_eq!(fixture.people().await?, 1);
    fixture.teardown().await
}

async fn async_fixture() -> Result<AsyncConnection, Box<dyn Error>> {
    let url = DatabaseUrl::parse("sqlite+sqlx:///:memory:")?;
    let engine = AsyncEngine::new(url, &EngineOptions::default(), None)?;
    apply_sqlite_hacks(&engine.clone().into())?;
    let conn = engine.connect().await?;
    conn.execute_batch(SCHEMA).await?;
    conn.begin().await?;
    conn.savepoint("fixture").await?;
    conn.execute(
        "INSERT INTO people (name) VALUES (?1)",
        &[RowValues::Text("Test person".into())],
    )
    .await?;
    Ok(conn)
}

async fn async_people(conn: &AsyncConnection) -> Result<i64, Box<dyn Error>> {
    let rs = conn.query("SELECT count(*) FROM people", &[]).await?;
    Ok(scalar_int(&rs)?)
}

#[tokio::test]
async fn async_add_and_roll_back() -> Result<(), Box<dyn Error>> {
    let conn = async_fixture().await?;
    let root = Context::new();
    SqlComponent::new(SqlComponentConfig::from_bind(conn.clone()))?
        .start(&root)
        .await?;

    let ctx = root.child();
    let session: AsyncSession = ctx.require_resource("default")?;
    assert!(
        session
            .execute("INSERT INTO people (name) VALUES (?1)", &[RowValues::Null])
            .await
            .is_err()
    );
    session.rollback().await?;
    session
        .add(
            "INSERT INTO people (name) VALUES (?1)",
            vec![RowValues::Text("Works now!".into())],
        )
        .await;
    ctx.close(None).await?;
    root.close(None).await?;

    assert_eq!(async_people(&conn).await?, 2);
    conn.rollback_to_savepoint("fixture").await?;
    conn.rollback().await?;
    assert_eq!(async_people(&conn).await?, 0);
    Ok(())
}
