//! Convenient imports for common functionality.

pub use crate::component::SqlComponent;
pub use crate::config::{EngineOptions, PoolClass, SessionOptions, SqlComponentConfig};
pub use crate::context::{Context, ScopeError};
pub use crate::engine::{AsyncEngine, Bind, SyncEngine};
pub use crate::error::SqlComponentError;
pub use crate::results::ResultSet;
pub use crate::session::{AsyncSession, AsyncSessionFactory, Session, SessionFactory};
pub use crate::types::RowValues;
