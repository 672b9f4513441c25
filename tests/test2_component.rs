use std::error::Error;
use std::sync::{Arc, Mutex};

use sql_component::prelude::*;
use sql_component::{
    AnySessionFactory, AsyncBind, DatabaseUrl, LifecycleState, SessionEvents, SyncBind,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_component_publishes_its_resources() -> Result<(), Box<dyn Error>> {
    for name in ["default", "alternate"] {
        let config = SqlComponentConfig::from_url("sqlite:///:memory:")
            .with_prefer_async(false)
            .with_resource_name(name);
        let component = SqlComponent::new(config)?;
        let ctx = Context::new();
        component.start(&ctx).await?;
        assert_eq!(component.state(), LifecycleState::Started);

        let engine: SyncEngine = ctx.require_resource(name)?;
        let factory: SessionFactory = ctx.require_resource(name)?;
        let session: Session = ctx.require_resource(name)?;
        assert!(factory.bind().engine().same_engine(&engine));
        assert!(session.bind().engine().same_engine(&engine));
        assert!(!ctx.has_resource::<AsyncEngine>(name));

        ctx.close(None).await?;
        assert_eq!(component.state(), LifecycleState::Stopped);
    }
    Ok(())
}

#[tokio::test]
async fn async_component_publishes_its_resources() -> Result<(), Box<dyn Error>> {
    for name in ["default", "alternate"] {
        let config = SqlComponentConfig::from_url("sqlite+sqlx:///:memory:").with_resource_name(name);
        let component = SqlComponent::new(config)?;
        let ctx = Context::new();
        component.start(&ctx).await?;

        let engine: AsyncEngine = ctx.require_resource(name)?;
        let factory: AsyncSessionFactory = ctx.require_resource(name)?;
        let _events: SessionEvents = ctx.require_resource(name)?;
        let session: AsyncSession = ctx.require_resource(name)?;
        assert!(factory.bind().engine().same_engine(&engine));
        assert!(session.bind().engine().same_engine(&engine));
        assert!(!ctx.has_resource::<SessionFactory>(name));

        ctx.close(None).await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ready_callback_sees_the_published_bind() -> Result<(), Box<dyn Error>> {
    let seen: Arc<Mutex<Option<Bind>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&seen);
    let config = SqlComponentConfig::from_url("sqlite:///:memory:")
        .with_prefer_async(false)
        .with_ready_callback(move |bind, factory| {
            assert!(!factory.is_async());
            *slot.lock().unwrap() = Some(bind.clone());
            Ok(())
        });
    let component = SqlComponent::new(config)?;
    let ctx = Context::new();
    component.start(&ctx).await?;

    let engine: SyncEngine = ctx.require_resource("default")?;
    match seen.lock().unwrap().take() {
        Some(Bind::Sync(SyncBind::Engine(bound))) => assert!(bound.same_engine(&engine)),
        other => panic!("unexpected bind: {other:?}"),
    }
    ctx.close(None).await?;
    Ok(())
}

#[tokio::test]
async fn async_ready_callback_runs_before_publication() -> Result<(), Box<dyn Error>> {
    let seen: Arc<Mutex<Option<AnySessionFactory>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&seen);
    let config = SqlComponentConfig::from_url("sqlite:///:memory:").with_async_ready_callback(
        move |_bind, factory| {
            let slot = Arc::clone(&slot);
            async move {
                tokio::task::yield_now().await;
                *slot.lock().unwrap() = Some(factory);
                Ok(())
            }
        },
    );
    let component = SqlComponent::new(config)?;
    let ctx = Context::new();
    component.start(&ctx).await?;

    let published: AsyncSessionFactory = ctx.require_resource("default")?;
    match seen.lock().unwrap().take() {
        Some(AnySessionFactory::Async(factory)) => {
            assert!(factory.bind().engine().same_engine(published.bind().engine()));
        }
        other => panic!("unexpected factory: {other:?}"),
    }
    ctx.close(None).await?;
    Ok(())
}

#[tokio::test]
async fn failing_ready_callback_publishes_nothing() -> Result<(), Box<dyn Error>> {
    let config = SqlComponentConfig::from_url("sqlite:///:memory:")
        .with_ready_callback(|_, _| Err("not today".into()));
    let component = SqlComponent::new(config)?;
    let ctx = Context::new();

    let err = component.start(&ctx).await.unwrap_err();
    assert!(matches!(err, SqlComponentError::Callback(_)));
    assert!(err.to_string().contains("not today"));
    assert_eq!(component.state(), LifecycleState::Unstarted);
    assert!(!ctx.has_resource::<AsyncEngine>("default"));
    assert!(!ctx.has_resource::<AsyncSession>("default"));
    ctx.close(None).await?;
    Ok(())
}

#[tokio::test]
async fn starting_twice_is_rejected() -> Result<(), Box<dyn Error>> {
    let component = SqlComponent::new(SqlComponentConfig::from_url("sqlite:///:memory:"))?;
    let ctx = Context::new();
    component.start(&ctx).await?;
    let err = component.start(&ctx).await.unwrap_err();
    assert!(matches!(err, SqlComponentError::LifecycleError(_)));
    ctx.close(None).await?;

    let err = component.start(&Context::new()).await.unwrap_err();
    assert!(matches!(err, SqlComponentError::LifecycleError(_)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engine_bind_is_published_and_disposed() -> Result<(), Box<dyn Error>> {
    let url = DatabaseUrl::parse("sqlite:///:memory:")?;
    let engine = SyncEngine::new(url, &EngineOptions::default(), None)?;
    let component = SqlComponent::new(SqlComponentConfig::from_bind(engine.clone()))?;
    let ctx = Context::new();
    component.start(&ctx).await?;

    let published: SyncEngine = ctx.require_resource("default")?;
    assert!(published.same_engine(&engine));
    let session: Session = ctx.require_resource("default")?;
    assert!(session.bind().is_engine());
    session.execute("SELECT 1", &[]).await?;
    assert_eq!(engine.status().checked_out, 1);

    ctx.close(None).await?;
    assert!(!session.has_connection());
    assert_eq!(engine.status().connections, 0);
    Ok(())
}

#[tokio::test]
async fn connection_bind_is_shared_not_disposed() -> Result<(), Box<dyn Error>> {
    let url = DatabaseUrl::parse("sqlite+sqlx:///:memory:")?;
    let engine = AsyncEngine::new(url, &EngineOptions::default(), None)?;
    let conn = engine.connect().await?;
    conn.execute_batch("CREATE TABLE foo (id INTEGER PRIMARY KEY)").await?;

    let component = SqlComponent::new(SqlComponentConfig::from_bind(conn.clone()))?;
    let ctx = Context::new();
    component.start(&ctx).await?;

    let published: AsyncEngine = ctx.require_resource("default")?;
    assert!(published.same_engine(&engine));
    let session: AsyncSession = ctx.require_resource("default")?;
    assert!(matches!(session.bind(), AsyncBind::Connection(_)));
    session.execute("INSERT INTO foo (id) VALUES (1)", &[]).await?;
    ctx.close(None).await?;

    // the caller's connection survives the component and sees the committed row
    let rs = conn.query("SELECT count(*) FROM foo", &[]).await?;
    assert_eq!(rs.scalar().and_then(RowValues::as_int), Some(&1));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closed_context_is_not_kept_alive() -> Result<(), Box<dyn Error>> {
    let component = SqlComponent::new(
        SqlComponentConfig::from_url("sqlite:///:memory:").with_prefer_async(false),
    )?;
    let ctx = Context::new();
    component.start(&ctx).await?;
    let session: Session = ctx.require_resource("default")?;
    session.execute("SELECT 1", &[]).await?;

    let weak = ctx.downgrade();
    ctx.close(None).await?;
    drop(ctx);
    assert!(weak.upgrade().is_none());

    let async_component = SqlComponent::new(SqlComponentConfig::from_url("sqlite:///:memory:"))?;
    let ctx = Context::new();
    async_component.start(&ctx).await?;
    let session: AsyncSession = ctx.require_resource("default")?;
    session.execute("SELECT 1", &[]).await?;
    let weak = ctx.downgrade();
    ctx.close(None).await?;
    drop(ctx);
    assert!(weak.upgrade().is_none());
    Ok(())
}
