use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use super::SessionId;

/// Transaction milestones a session reports to its factory's listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    AfterBegin,
    BeforeCommit,
    AfterCommit,
    AfterRollback,
}

pub type SessionListener = Arc<dyn Fn(SessionEvent, SessionId) + Send + Sync>;

/// Listener registry shared by every session of one factory.
///
/// Listeners run on whichever thread performs the operation; for synchronous sessions
/// finalised by a component that is a commit executor worker.
#[derive(Clone, Default)]
pub struct SessionEvents {
    listeners: Arc<RwLock<Vec<(SessionEvent, SessionListener)>>>,
}

impl SessionEvents {
    /// Register `listener` for `event`.
    pub fn listen<F>(&self, event: SessionEvent, listener: F)
    where
        F: Fn(SessionEvent, SessionId) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((event, Arc::new(listener)));
    }

    pub(crate) fn dispatch(&self, event: SessionEvent, id: SessionId) {
        let matching: Vec<SessionListener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(registered, _)| *registered == event)
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in matching {
            listener(event, id);
        }
    }

    pub(crate) fn dispatch_all(&self, events: &[SessionEvent], id: SessionId) {
        for event in events {
            self.dispatch(*event, id);
        }
    }
}

impl fmt::Debug for SessionEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("SessionEvents")
            .field("listeners", &count)
            .finish()
    }
}
