use std::sync::{PoisonError, RwLock};

use super::framing::TxFraming;

/// Run on every new physical connection, in registration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectHook {
    /// Switch the connection's transaction framing.
    SetFraming(TxFraming),
    /// Execute a statement batch.
    Execute(String),
}

/// Run whenever a root transaction begins on a connection, after the driver's own framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginHook {
    Execute(String),
}

/// Event listeners scoped to one engine and every connection it opens.
#[derive(Debug, Default)]
pub struct EngineEvents {
    connect: RwLock<Vec<ConnectHook>>,
    begin: RwLock<Vec<BeginHook>>,
}

impl EngineEvents {
    pub fn listen_connect(&self, hook: ConnectHook) {
        self.connect
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    pub fn listen_begin(&self, hook: BeginHook) {
        self.begin
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    #[must_use]
    pub fn connect_hooks(&self) -> Vec<ConnectHook> {
        self.connect
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn begin_hooks(&self) -> Vec<BeginHook> {
        self.begin
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
