use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::config::{ReadyCallback, SqlComponentConfig};
use crate::context::{Context, ScopeError};
use crate::engine::{AsyncBind, AsyncEngine, Bind, SyncBind, SyncEngine};
use crate::error::SqlComponentError;
use crate::executor::CommitExecutor;
use crate::resolve::resolve_bind;
use crate::session::{
    AnySessionFactory, AsyncSession, AsyncSessionFactory, Session, SessionEvents, SessionFactory,
    make_factory,
};

/// Where a component is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unstarted,
    Started,
    Stopped,
}

/// Publishes an engine, a session factory and scoped sessions into a [`Context`].
///
/// Sessions handed out by the context are finalised when the scope that requested them
/// closes: committed when it closed cleanly, rolled back when it closed with an error, and
/// closed either way.
pub struct SqlComponent {
    bind: Bind,
    factory: AnySessionFactory,
    ready_callback: Option<Arc<dyn ReadyCallback>>,
    resource_name: String,
    commit_executor_workers: usize,
    state: Arc<Mutex<LifecycleState>>,
}

impl SqlComponent {
    /// Resolve the bind and build the session factory.
    ///
    /// # Errors
    /// Returns `SqlComponentError::ConfigError` unless exactly one of `url` and `bind` is
    /// configured; engine construction errors are returned unchanged.
    pub fn new(config: SqlComponentConfig) -> Result<Self, SqlComponentError> {
        let bind = resolve_bind(
            config.url.as_ref(),
            config.bind.as_ref(),
            &config.engine_options,
            config.prefer_async,
            config.poolclass,
        )?;
        let factory = make_factory(&bind, config.session_options.clone());
        Ok(Self {
            bind,
            factory,
            ready_callback: config.ready_callback,
            resource_name: config.resource_name,
            commit_executor_workers: config.commit_executor_workers,
            state: Arc::new(Mutex::new(LifecycleState::Unstarted)),
        })
    }

    #[must_use]
    pub fn bind(&self) -> &Bind {
        &self.bind
    }

    #[must_use]
    pub fn factory(&self) -> &AnySessionFactory {
        &self.factory
    }

    #[must_use]
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    /// Run the ready callback, then publish every resource into `ctx` and register the
    /// shutdown sequence on it.
    ///
    /// Nothing is published when this fails, and the component can be started again.
    ///
    /// # Errors
    /// Returns `SqlComponentError::LifecycleError` if the component was already started,
    /// `SqlComponentError::Callback` if the ready callback fails, and
    /// `SqlComponentError::ResourceError` if `ctx` already holds one of the resources.
    pub async fn start(&self, ctx: &Context) -> Result<(), SqlComponentError> {
        {
            let mut state = lock(&self.state);
            if *state != LifecycleState::Unstarted {
                return Err(SqlComponentError::LifecycleError(format!(
                    "SQL component {:?} cannot be started from state {:?}",
                    self.resource_name, *state
                )));
            }
            *state = LifecycleState::Started;
        }
        let result = self.publish(ctx).await;
        if result.is_err() {
            *lock(&self.state) = LifecycleState::Unstarted;
        }
        result
    }

    fn check_conflicts(&self, ctx: &Context) -> Result<(), SqlComponentError> {
        let name = self.resource_name.as_str();
        let taken = match &self.factory {
            AnySessionFactory::Sync(_) => {
                ctx.has_local::<SyncEngine>(name)
                    || ctx.has_local::<SessionFactory>(name)
                    || ctx.has_local::<Session>(name)
            }
            AnySessionFactory::Async(_) => {
                ctx.has_local::<AsyncEngine>(name)
                    || ctx.has_local::<AsyncSessionFactory>(name)
                    || ctx.has_local::<SessionEvents>(name)
                    || ctx.has_local::<AsyncSession>(name)
            }
        };
        if taken {
            return Err(SqlComponentError::ResourceError(format!(
                "the context already contains SQL resources named {name:?}"
            )));
        }
        if ctx.is_closed() {
            return Err(SqlComponentError::LifecycleError(
                "cannot start a component in a closed context".into(),
            ));
        }
        Ok(())
    }

    async fn publish(&self, ctx: &Context) -> Result<(), SqlComponentError> {
        if let Some(callback) = &self.ready_callback {
            callback
                .on_ready(&self.bind, &self.factory)
                .await
                .map_err(SqlComponentError::Callback)?;
        }
        self.check_conflicts(ctx)?;

        let name = self.resource_name.as_str();
        match (&self.bind, &self.factory) {
            (Bind::Sync(bind), AnySessionFactory::Sync(factory)) => {
                ctx.add_resource(bind.engine().clone(), name)?;
                ctx.add_resource(factory.clone(), name)?;

                let executor = CommitExecutor::new("sql-commit", self.commit_executor_workers);
                let session_factory = factory.clone();
                let session_executor = executor.clone();
                ctx.add_resource_factory(name, move |scope: &Context| {
                    create_session(scope, &session_factory, &session_executor)
                })?;
                ctx.add_teardown_callback(move |_| async move { executor.shutdown().await })?;
            }
            (Bind::Async(bind), AnySessionFactory::Async(factory)) => {
                ctx.add_resource(bind.engine().clone(), name)?;
                ctx.add_resource(factory.clone(), name)?;
                ctx.add_resource(factory.events().clone(), name)?;

                let session_factory = factory.clone();
                ctx.add_resource_factory(name, move |scope: &Context| {
                    create_async_session(scope, &session_factory)
                })?;
            }
            _ => {
                return Err(SqlComponentError::ConfigError(
                    "session factory does not match the bind's execution mode".into(),
                ));
            }
        }

        let bind = self.bind.clone();
        let state = Arc::clone(&self.state);
        let resource_name = self.resource_name.clone();
        ctx.add_teardown_callback(move |_| async move {
            match &bind {
                Bind::Sync(SyncBind::Engine(engine)) => engine.dispose(),
                Bind::Async(AsyncBind::Engine(engine)) => engine.dispose().await,
                Bind::Sync(SyncBind::Connection(_)) | Bind::Async(AsyncBind::Connection(_)) => {}
            }
            *lock(&state) = LifecycleState::Stopped;
            info!("SQL resources ({resource_name}) shut down");
            Ok(())
        })?;

        info!(
            "Configured SQL resources ({name}; dialect={}, driver={})",
            self.bind.dialect().name(),
            self.bind.driver().name()
        );
        Ok(())
    }
}

impl fmt::Debug for SqlComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlComponent")
            .field("bind", &self.bind)
            .field("resource_name", &self.resource_name)
            .field("commit_executor_workers", &self.commit_executor_workers)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock(state: &Mutex<LifecycleState>) -> MutexGuard<'_, LifecycleState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn create_session(
    scope: &Context,
    factory: &SessionFactory,
    executor: &CommitExecutor,
) -> Result<Session, SqlComponentError> {
    let session = factory.create();
    let hook_session = session.clone();
    let executor = executor.clone();
    scope.add_teardown_callback(move |error| finalize_session(hook_session, executor, error))?;
    Ok(session)
}

fn create_async_session(
    scope: &Context,
    factory: &AsyncSessionFactory,
) -> Result<AsyncSession, SqlComponentError> {
    let session = factory.create();
    let hook_session = session.clone();
    scope.add_teardown_callback(move |error| finalize_async_session(hook_session, error))?;
    Ok(session)
}

/// Closes the session in the background if the teardown future is dropped before it could.
struct CloseOnDrop {
    session: Option<Session>,
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if let (Some(session), Ok(handle)) = (self.session.take(), Handle::try_current()) {
            handle.spawn_blocking(move || session.close_blocking());
        }
    }
}

struct AsyncCloseOnDrop {
    session: Option<AsyncSession>,
}

impl Drop for AsyncCloseOnDrop {
    fn drop(&mut self) {
        if let (Some(session), Ok(handle)) = (self.session.take(), Handle::try_current()) {
            handle.spawn(async move { session.close().await });
        }
    }
}

/// A commit or rollback failure outranks a close failure, which is only logged.
fn settle(
    outcome: Result<(), SqlComponentError>,
    closed: Result<(), SqlComponentError>,
) -> Result<(), SqlComponentError> {
    match (outcome, closed) {
        (Err(e), Err(close_err)) => {
            warn!(error = %close_err, "closing the session failed after commit or rollback failed");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), closed) => closed,
    }
}

async fn finalize_session(
    session: Session,
    executor: CommitExecutor,
    error: Option<ScopeError>,
) -> Result<(), SqlComponentError> {
    let mut guard = CloseOnDrop {
        session: Some(session.clone()),
    };
    let outcome = if session.in_transaction() {
        let worker_session = session.clone();
        debug!(session = %session.id(), rollback = error.is_some(), "finalizing session");
        if error.is_none() {
            executor.run(move || worker_session.commit_blocking()).await
        } else {
            executor.run(move || worker_session.rollback_blocking()).await
        }
    } else {
        Ok(())
    };
    let closed = session.close().await;
    guard.session = None;
    settle(outcome, closed)
}

async fn finalize_async_session(
    session: AsyncSession,
    error: Option<ScopeError>,
) -> Result<(), SqlComponentError> {
    let mut guard = AsyncCloseOnDrop {
        session: Some(session.clone()),
    };
    let outcome = if session.in_transaction().await {
        debug!(session = %session.id(), rollback = error.is_some(), "finalizing async session");
        if error.is_none() {
            session.commit().await
        } else {
            session.rollback().await
        }
    } else {
        Ok(())
    };
    let closed = session.close().await;
    guard.session = None;
    settle(outcome, closed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_failure_outranks_close_failure() {
        let err = settle(
            Err(SqlComponentError::ExecutionError("commit".into())),
            Err(SqlComponentError::ExecutionError("close".into())),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "SQL execution error: commit");

        let err = settle(Ok(()), Err(SqlComponentError::ExecutionError("close".into())))
            .unwrap_err();
        assert_eq!(err.to_string(), "SQL execution error: close");
        assert!(settle(Ok(()), Ok(())).is_ok());
    }

    #[tokio::test]
    async fn failed_start_can_be_retried() {
        let component = SqlComponent::new(SqlComponentConfig::from_url("sqlite:///:memory:"))
            .unwrap();
        let ctx = Context::new();
        ctx.add_resource(SessionEvents::default(), "default").unwrap();

        let err = component.start(&ctx).await.unwrap_err();
        assert!(matches!(err, SqlComponentError::ResourceError(_)));
        assert_eq!(component.state(), LifecycleState::Unstarted);
        assert!(!ctx.has_resource::<AsyncEngine>("default"));

        let other = Context::new();
        component.start(&other).await.unwrap();
        assert_eq!(component.state(), LifecycleState::Started);
        other.close(None).await.unwrap();
        assert_eq!(component.state(), LifecycleState::Stopped);
        ctx.close(None).await.unwrap();
    }
}
