//! Session factories and the sessions they produce.

pub mod asynch;
pub mod events;
pub mod sync;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

pub use asynch::AsyncSession;
pub use events::{SessionEvent, SessionEvents, SessionListener};
pub use sync::Session;

use crate::config::SessionOptions;
use crate::engine::{AsyncBind, Bind, SyncBind};

/// Process-unique session identifier, handed to event listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

fn fixed_options(mut options: SessionOptions) -> SessionOptions {
    options.expire_on_commit = false;
    options
}

struct FactoryInner<B> {
    bind: B,
    options: SessionOptions,
    events: SessionEvents,
}

/// Produces synchronous [`Session`]s bound to one [`SyncBind`].
#[derive(Clone)]
pub struct SessionFactory {
    inner: Arc<FactoryInner<SyncBind>>,
}

impl SessionFactory {
    /// `expire_on_commit` is always turned off.
    #[must_use]
    pub fn new(bind: SyncBind, options: SessionOptions) -> Self {
        Self::with_events(bind, options, SessionEvents::default())
    }

    #[must_use]
    pub fn with_events(bind: SyncBind, options: SessionOptions, events: SessionEvents) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                bind,
                options: fixed_options(options),
                events,
            }),
        }
    }

    #[must_use]
    pub fn create(&self) -> Session {
        let session = Session::new(
            self.inner.bind.clone(),
            self.inner.options.clone(),
            self.inner.events.clone(),
        );
        debug!(session = %session.id(), "created session");
        session
    }

    #[must_use]
    pub fn bind(&self) -> &SyncBind {
        &self.inner.bind
    }

    #[must_use]
    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    #[must_use]
    pub fn events(&self) -> &SessionEvents {
        &self.inner.events
    }
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("bind", &self.inner.bind)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

/// Produces [`AsyncSession`]s bound to one [`AsyncBind`].
#[derive(Clone)]
pub struct AsyncSessionFactory {
    inner: Arc<FactoryInner<AsyncBind>>,
}

impl AsyncSessionFactory {
    /// `expire_on_commit` is always turned off.
    #[must_use]
    pub fn new(bind: AsyncBind, options: SessionOptions) -> Self {
        Self::with_events(bind, options, SessionEvents::default())
    }

    #[must_use]
    pub fn with_events(bind: AsyncBind, options: SessionOptions, events: SessionEvents) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                bind,
                options: fixed_options(options),
                events,
            }),
        }
    }

    #[must_use]
    pub fn create(&self) -> AsyncSession {
        let session = AsyncSession::new(
            self.inner.bind.clone(),
            self.inner.options.clone(),
            self.inner.events.clone(),
        );
        debug!(session = %session.id(), "created async session");
        session
    }

    #[must_use]
    pub fn bind(&self) -> &AsyncBind {
        &self.inner.bind
    }

    #[must_use]
    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    /// Registry for listeners observing the transaction events of every session.
    #[must_use]
    pub fn events(&self) -> &SessionEvents {
        &self.inner.events
    }
}

impl fmt::Debug for AsyncSessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSessionFactory")
            .field("bind", &self.inner.bind)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

/// Either flavour of session factory; what a ready callback receives.
#[derive(Debug, Clone)]
pub enum AnySessionFactory {
    Sync(SessionFactory),
    Async(AsyncSessionFactory),
}

impl AnySessionFactory {
    #[must_use]
    pub fn is_async(&self) -> bool {
        matches!(self, AnySessionFactory::Async(_))
    }

    #[must_use]
    pub fn options(&self) -> &SessionOptions {
        match self {
            AnySessionFactory::Sync(factory) => factory.options(),
            AnySessionFactory::Async(factory) => factory.options(),
        }
    }

    #[must_use]
    pub fn events(&self) -> &SessionEvents {
        match self {
            AnySessionFactory::Sync(factory) => factory.events(),
            AnySessionFactory::Async(factory) => factory.events(),
        }
    }
}

/// Build the session factory matching the bind's execution mode.
#[must_use]
pub fn make_factory(bind: &Bind, options: SessionOptions) -> AnySessionFactory {
    match bind {
        Bind::Sync(bind) => AnySessionFactory::Sync(SessionFactory::new(bind.clone(), options)),
        Bind::Async(bind) => {
            AnySessionFactory::Async(AsyncSessionFactory::new(bind.clone(), options))
        }
    }
}
