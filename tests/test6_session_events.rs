use std::error::Error;
use std::sync::{Arc, Mutex};
use std::thread;

use sql_component::prelude::*;
use sql_component::{SessionEvent, SessionEvents, SessionId};
use tracing::Instrument;

#[derive(Debug, Clone)]
struct Observed {
    event: SessionEvent,
    session: SessionId,
    thread: Option<String>,
    span: Option<String>,
}

fn record(events: &SessionEvents, event: SessionEvent, log: &Arc<Mutex<Vec<Observed>>>) {
    let log = Arc::clone(log);
    events.listen(event, move |event, session| {
        log.lock().unwrap().push(Observed {
            event,
            session,
            thread: thread::current().name().map(str::to_owned),
            span: tracing::Span::current()
                .metadata()
                .map(|meta| meta.name().to_owned()),
        });
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_commit_runs_on_an_executor_thread_inside_the_callers_span()
-> Result<(), Box<dyn Error>> {
    let subscriber = tracing_subscriber::fmt().with_test_writer().finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let component = SqlComponent::new(
        SqlComponentConfig::from_url("sqlite:///:memory:")
            .with_prefer_async(false)
            .with_commit_executor_workers(2),
    )?;
    let ctx = Context::new();
    component.start(&ctx).await?;

    let log = Arc::new(Mutex::new(Vec::new()));
    let factory: SessionFactory = ctx.require_resource("default")?;
    record(factory.events(), SessionEvent::BeforeCommit, &log);
    record(factory.events(), SessionEvent::AfterCommit, &log);

    let session: Session = ctx.require_resource("default")?;
    session
        .execute_batch("CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT)")
        .await?;
    session.add(
        "INSERT INTO people (name) VALUES (?1)",
        vec![RowValues::Text("Test person".into())],
    );

    ctx.close(None)
        .instrument(tracing::info_span!("request"))
        .await?;

    let observed = log.lock().unwrap().clone();
    assert_eq!(observed.len(), 2);
    assert_eq!(observed[0].event, SessionEvent::BeforeCommit);
    assert_eq!(observed[1].event, SessionEvent::AfterCommit);
    for entry in &observed {
        assert_eq!(entry.session, session.id());
        let name = entry.thread.as_deref().unwrap_or_default();
        assert!(name.starts_with("sql-commit-"), "ran on {name:?}");
        assert_eq!(entry.span.as_deref(), Some("request"));
    }
    Ok(())
}

#[tokio::test]
async fn async_commit_runs_on_the_calling_thread() -> Result<(), Box<dyn Error>> {
    let component = SqlComponent::new(SqlComponentConfig::from_url("sqlite:///:memory:"))?;
    let ctx = Context::new();
    component.start(&ctx).await?;

    let log = Arc::new(Mutex::new(Vec::new()));
    let events: SessionEvents = ctx.require_resource("default")?;
    record(&events, SessionEvent::BeforeCommit, &log);
    record(&events, SessionEvent::AfterBegin, &log);

    let session: AsyncSession = ctx.require_resource("default")?;
    session
        .execute_batch("CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT)")
        .await?;
    ctx.close(None).await?;

    let caller = thread::current().name().map(str::to_owned);
    let observed = log.lock().unwrap().clone();
    let kinds: Vec<SessionEvent> = observed.iter().map(|entry| entry.event).collect();
    assert_eq!(kinds, vec![SessionEvent::AfterBegin, SessionEvent::BeforeCommit]);
    assert!(observed.iter().all(|entry| entry.thread == caller));
    Ok(())
}

#[tokio::test]
async fn rollback_is_reported() -> Result<(), Box<dyn Error>> {
    let component = SqlComponent::new(SqlComponentConfig::from_url("sqlite:///:memory:"))?;
    let ctx = Context::new();
    component.start(&ctx).await?;

    let log = Arc::new(Mutex::new(Vec::new()));
    let factory: AsyncSessionFactory = ctx.require_resource("default")?;
    record(factory.events(), SessionEvent::AfterRollback, &log);
    record(factory.events(), SessionEvent::BeforeCommit, &log);

    let session: AsyncSession = ctx.require_resource("default")?;
    session.execute("SELECT 1", &[]).await?;
    ctx.close(Some(ScopeError::msg("dummy"))).await?;

    let kinds: Vec<SessionEvent> = log.lock().unwrap().iter().map(|entry| entry.event).collect();
    assert_eq!(kinds, vec![SessionEvent::AfterRollback]);
    Ok(())
}
