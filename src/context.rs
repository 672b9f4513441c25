//! A scoped resource container with teardown callbacks.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tracing::{debug, trace};

use crate::error::SqlComponentError;

/// The error a scope ended with, as seen by its teardown callbacks.
#[derive(Clone)]
pub struct ScopeError(Arc<dyn Error + Send + Sync + 'static>);

impl ScopeError {
    pub fn new(error: impl Error + Send + Sync + 'static) -> Self {
        ScopeError(Arc::new(error))
    }

    /// A scope error carrying only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        ScopeError(Arc::new(SqlComponentError::Other(message.into())))
    }

    #[must_use]
    pub fn inner(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.0
    }
}

impl fmt::Debug for ScopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ScopeError").field(&self.0).finish()
    }
}

impl fmt::Display for ScopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<SqlComponentError> for ScopeError {
    fn from(err: SqlComponentError) -> Self {
        ScopeError::new(err)
    }
}

type Key = (TypeId, String);
type Resource = Arc<dyn Any + Send + Sync>;
type ResourceFactory = Arc<dyn Fn(&Context) -> Result<Resource, SqlComponentError> + Send + Sync>;
type TeardownCallback =
    Box<dyn FnOnce(Option<ScopeError>) -> BoxFuture<'static, Result<(), SqlComponentError>> + Send>;

#[derive(Default)]
struct ContextState {
    resources: HashMap<Key, Resource>,
    factories: HashMap<Key, ResourceFactory>,
    // factory results, visible only to the scope that created them
    created: HashMap<Key, Resource>,
    teardown: Vec<TeardownCallback>,
    closed: bool,
}

struct ContextInner {
    parent: Option<Context>,
    state: Mutex<ContextState>,
}

/// A resource scope.
///
/// Resources are looked up by type and name, first in this scope and then in its parents.
/// A resource factory runs in the scope that requested the resource and its result is cached
/// there, so a child scope never sees a value its parent created from the same factory.
/// Teardown callbacks run once, newest first, when the scope is closed.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

/// A non-owning handle to a [`Context`].
#[derive(Clone)]
pub struct WeakContext(Weak<ContextInner>);

impl WeakContext {
    #[must_use]
    pub fn upgrade(&self) -> Option<Context> {
        self.0.upgrade().map(|inner| Context { inner })
    }
}

fn key<T: 'static>(name: &str) -> Key {
    (TypeId::of::<T>(), name.to_owned())
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// A root scope.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<Context>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                parent,
                state: Mutex::new(ContextState::default()),
            }),
        }
    }

    /// A nested scope that sees this scope's resources.
    #[must_use]
    pub fn child(&self) -> Self {
        Self::with_parent(Some(self.clone()))
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Context> {
        self.inner.parent.as_ref()
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakContext {
        WeakContext(Arc::downgrade(&self.inner))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn open_state(&self) -> Result<MutexGuard<'_, ContextState>, SqlComponentError> {
        let state = self.lock_state();
        if state.closed {
            return Err(SqlComponentError::LifecycleError(
                "context is already closed".into(),
            ));
        }
        Ok(state)
    }

    fn conflict<T: 'static>(name: &str) -> SqlComponentError {
        SqlComponentError::ResourceError(format!(
            "this context already contains a resource of type {} named {name:?}",
            type_name::<T>()
        ))
    }

    /// True if this scope itself holds a resource or factory for `T` under `name`.
    pub(crate) fn has_local<T: 'static>(&self, name: &str) -> bool {
        let key = key::<T>(name);
        let state = self.lock_state();
        state.resources.contains_key(&key) || state.factories.contains_key(&key)
    }

    /// Publish `value` under `name`.
    ///
    /// # Errors
    /// Returns `SqlComponentError::ResourceError` if this scope already has a `T` named `name`.
    pub fn add_resource<T>(&self, value: T, name: &str) -> Result<(), SqlComponentError>
    where
        T: Any + Send + Sync + Clone,
    {
        let key = key::<T>(name);
        let mut state = self.open_state()?;
        if state.resources.contains_key(&key) || state.factories.contains_key(&key) {
            return Err(Self::conflict::<T>(name));
        }
        state.resources.insert(key, Arc::new(value));
        trace!(resource = type_name::<T>(), name, "added resource");
        Ok(())
    }

    /// Publish a factory that creates a `T` the first time a scope asks for one.
    ///
    /// # Errors
    /// Returns `SqlComponentError::ResourceError` if this scope already has a `T` named `name`.
    pub fn add_resource_factory<T, F>(&self, name: &str, factory: F) -> Result<(), SqlComponentError>
    where
        T: Any + Send + Sync + Clone,
        F: Fn(&Context) -> Result<T, SqlComponentError> + Send + Sync + 'static,
    {
        let key = key::<T>(name);
        let mut state = self.open_state()?;
        if state.resources.contains_key(&key) || state.factories.contains_key(&key) {
            return Err(Self::conflict::<T>(name));
        }
        let factory: ResourceFactory = Arc::new(move |ctx: &Context| {
            factory(ctx).map(|value| Arc::new(value) as Resource)
        });
        state.factories.insert(key, factory);
        trace!(resource = type_name::<T>(), name, "added resource factory");
        Ok(())
    }

    /// True if this scope or a parent can provide a `T` named `name`.
    #[must_use]
    pub fn has_resource<T: Any>(&self, name: &str) -> bool {
        let mut scope = Some(self);
        while let Some(ctx) = scope {
            if ctx.has_local::<T>(name) {
                return true;
            }
            scope = ctx.parent();
        }
        false
    }

    /// Look up a `T` named `name`, creating it from a factory if needed.
    ///
    /// # Errors
    /// Returns the factory's error, or `SqlComponentError::LifecycleError` if a factory result
    /// would have to be cached in a closed scope.
    pub fn get_resource<T>(&self, name: &str) -> Result<Option<T>, SqlComponentError>
    where
        T: Any + Send + Sync + Clone,
    {
        let key = key::<T>(name);
        if let Some(resource) = self.lock_state().created.get(&key) {
            return Ok(resource.downcast_ref::<T>().cloned());
        }
        let mut scope = Some(self);
        while let Some(ctx) = scope {
            let factory = {
                let state = ctx.lock_state();
                if let Some(resource) = state.resources.get(&key) {
                    return Ok(resource.downcast_ref::<T>().cloned());
                }
                state.factories.get(&key).cloned()
            };
            if let Some(factory) = factory {
                drop(self.open_state()?);
                let resource = factory(self)?;
                let value = resource.downcast_ref::<T>().cloned();
                self.open_state()?.created.insert(key, resource);
                debug!(resource = type_name::<T>(), name, "created resource from factory");
                return Ok(value);
            }
            scope = ctx.parent();
        }
        Ok(None)
    }

    /// Like [`get_resource`](Context::get_resource) but a missing resource is an error.
    ///
    /// # Errors
    /// Returns `SqlComponentError::ResourceError` when no scope provides the resource.
    pub fn require_resource<T>(&self, name: &str) -> Result<T, SqlComponentError>
    where
        T: Any + Send + Sync + Clone,
    {
        self.get_resource::<T>(name)?.ok_or_else(|| {
            SqlComponentError::ResourceError(format!(
                "no resource of type {} named {name:?}",
                type_name::<T>()
            ))
        })
    }

    /// Register `callback` to run when this scope closes. It receives the error the scope
    /// ended with, if any.
    ///
    /// # Errors
    /// Returns `SqlComponentError::LifecycleError` if the scope is already closed.
    pub fn add_teardown_callback<F, Fut>(&self, callback: F) -> Result<(), SqlComponentError>
    where
        F: FnOnce(Option<ScopeError>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), SqlComponentError>> + Send + 'static,
    {
        let callback: TeardownCallback = Box::new(move |error| callback(error).boxed());
        self.open_state()?.teardown.push(callback);
        Ok(())
    }

    /// Run the teardown callbacks newest first, then drop this scope's resources.
    ///
    /// Every callback runs even if an earlier one fails. A single failure is returned as is;
    /// several are wrapped in `SqlComponentError::Teardown`.
    ///
    /// # Errors
    /// Returns callback failures, or `SqlComponentError::LifecycleError` if the scope was
    /// already closed.
    pub async fn close(&self, error: Option<ScopeError>) -> Result<(), SqlComponentError> {
        let callbacks = {
            let mut state = self.open_state()?;
            state.closed = true;
            std::mem::take(&mut state.teardown)
        };
        debug!(callbacks = callbacks.len(), failed = error.is_some(), "closing context");

        let mut errors = Vec::new();
        for callback in callbacks.into_iter().rev() {
            if let Err(e) = callback(error.clone()).await {
                errors.push(e);
            }
        }

        let (resources, factories, created) = {
            let mut state = self.lock_state();
            (
                std::mem::take(&mut state.resources),
                std::mem::take(&mut state.factories),
                std::mem::take(&mut state.created),
            )
        };
        drop(created);
        drop(resources);
        drop(factories);

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(SqlComponentError::Teardown(errors)),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Context")
            .field("resources", &state.resources.len())
            .field("factories", &state.factories.len())
            .field("created", &state.created.len())
            .field("teardown_callbacks", &state.teardown.len())
            .field("closed", &state.closed)
            .field("has_parent", &self.inner.parent.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn resources_are_keyed_by_type_and_name() {
        let ctx = Context::new();
        ctx.add_resource(1_i32, "default").unwrap();
        ctx.add_resource(String::from("x"), "default").unwrap();
        ctx.add_resource(2_i32, "other").unwrap();

        assert_eq!(ctx.get_resource::<i32>("default").unwrap(), Some(1));
        assert_eq!(ctx.get_resource::<i32>("other").unwrap(), Some(2));
        assert_eq!(ctx.get_resource::<u8>("default").unwrap(), None);

        let err = ctx.add_resource(3_i32, "default").unwrap_err();
        assert!(matches!(err, SqlComponentError::ResourceError(_)));
    }

    #[test]
    fn factories_run_in_and_cache_in_the_requesting_scope() {
        let root = Context::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        root.add_resource_factory("default", move |_ctx: &Context| {
            Ok(counter.fetch_add(1, Ordering::SeqCst))
        })
        .unwrap();

        let first = root.child();
        let second = root.child();
        assert_eq!(first.require_resource::<usize>("default").unwrap(), 0);
        assert_eq!(first.require_resource::<usize>("default").unwrap(), 0);
        assert_eq!(second.require_resource::<usize>("default").unwrap(), 1);
        assert!(first.lock_state().created.contains_key(&key::<usize>("default")));
        assert!(!root.lock_state().created.contains_key(&key::<usize>("default")));
    }

    #[test]
    fn nested_scopes_do_not_inherit_factory_results() {
        let root = Context::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        root.add_resource_factory("default", move |_ctx: &Context| {
            Ok(counter.fetch_add(1, Ordering::SeqCst))
        })
        .unwrap();

        let outer = root.child();
        let inner = outer.child();
        assert_eq!(outer.require_resource::<usize>("default").unwrap(), 0);
        assert_eq!(inner.require_resource::<usize>("default").unwrap(), 1);
        assert_eq!(root.require_resource::<usize>("default").unwrap(), 2);
        assert_eq!(inner.require_resource::<usize>("default").unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // plain resources are still inherited
        root.add_resource(7_u8, "default").unwrap();
        assert_eq!(inner.require_resource::<u8>("default").unwrap(), 7);
    }

    #[tokio::test]
    async fn close_runs_callbacks_in_reverse_and_collects_errors() {
        let ctx = Context::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for idx in 0..3 {
            let order = Arc::clone(&order);
            ctx.add_teardown_callback(move |error| async move {
                order.lock().unwrap().push((idx, error.is_some()));
                if idx == 0 {
                    Err(SqlComponentError::Other("first".into()))
                } else {
                    Ok(())
                }
            })
            .unwrap();
        }

        let err = ctx.close(Some(ScopeError::msg("boom"))).await.unwrap_err();
        assert_eq!(err.to_string(), "Other database error: first");
        assert_eq!(
            *order.lock().unwrap(),
            vec![(2, true), (1, true), (0, true)]
        );

        let again = ctx.close(None).await.unwrap_err();
        assert!(matches!(again, SqlComponentError::LifecycleError(_)));
        assert!(ctx.add_resource(1_u8, "late").is_err());
    }

    #[tokio::test]
    async fn several_failures_are_wrapped() {
        let ctx = Context::new();
        for idx in 0..2 {
            ctx.add_teardown_callback(move |_| async move {
                Err(SqlComponentError::Other(format!("cb{idx}")))
            })
            .unwrap();
        }
        match ctx.close(None).await {
            Err(SqlComponentError::Teardown(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
