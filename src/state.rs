//! Server state shared by every session

use std::sync::Arc;

use crate::broadcast::BroadcastRegistry;
use crate::config::Config;
use crate::db::SqliteManager;
use crate::locks::FileLocks;
use crate::pool::Pool;

/// Backend pool used by sessions
pub type StorePool = Pool<SqliteManager>;

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    inner: Arc<ServerStateInner>,
}

struct ServerStateInner {
    config: Config,
    pool: StorePool,
    registry: BroadcastRegistry,
    locks: FileLocks,
}

impl ServerState {
    /// Create the state. The pool is shared, not owned: closing it is the
    /// caller's job once the server has stopped.
    pub fn new(config: Config, pool: StorePool) -> Self {
        Self {
            inner: Arc::new(ServerStateInner {
                config,
                pool,
                registry: BroadcastRegistry::new(),
                locks: FileLocks::new(),
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the backend pool
    pub fn pool(&self) -> &StorePool {
        &self.inner.pool
    }

    /// Get the broadcast registry
    pub fn registry(&self) -> &BroadcastRegistry {
        &self.inner.registry
    }

    /// Get the per-filename lock table
    pub fn locks(&self) -> &FileLocks {
        &self.inner.locks
    }
}
