//! Persistence Backend Pool
//!
//! Bounds concurrent use of the storage backend and hides connection churn
//! from callers.
//!
//! # Design
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                              Pool                                │
//! │                                                                  │
//! │  admission: Semaphore(N, fair)     slots: [Slot; N]              │
//! │                                                                  │
//! │  acquire(timeout) → permit → take Idle slot | connect into Empty │
//! │                                      ↓                           │
//! │                              PooledConnection                    │
//! │                                      ↓                           │
//! │  release() → ping → Idle | close + replace → drop permit         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Holding a permit guarantees a slot that is not `Leased`, so acquire and
//! release are index operations on the arena.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};

use crate::db::StoreError;

/// Lifecycle hooks for the pooled backend connections
#[async_trait::async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new connection
    async fn connect(&self) -> Result<Self::Connection, StoreError>;

    /// One-time setup run on the first connection handed out.
    /// Must be idempotent.
    async fn initialize(&self, conn: &mut Self::Connection) -> Result<(), StoreError>;

    /// Liveness probe run on every release
    async fn is_valid(&self, conn: &mut Self::Connection) -> bool;

    /// Close a connection that leaves the pool
    async fn close(&self, conn: Self::Connection);
}

/// Pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("No backend connection available within {timeout:?}")]
    Exhausted { timeout: Duration },

    #[error("Pool is closed")]
    Closed,

    #[error("Backend unavailable: {0}")]
    Backend(#[from] StoreError),
}

impl PoolError {
    /// Whether trying again later can succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

/// Pool tunables
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of slots and admission permits
    pub max_connections: usize,
    /// Deadline for a single acquire
    pub acquire_timeout: Duration,
    /// Attempts made by [`Pool::acquire_with_retry`]
    pub acquire_attempts: u32,
    /// Base delay between attempts (multiplied by the attempt number)
    pub retry_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            acquire_attempts: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

enum Slot<C> {
    Empty,
    Idle(C),
    Leased,
}

/// Bounded pool of backend connections
pub struct Pool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ConnectionManager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<M: ConnectionManager> {
    manager: M,
    slots: Mutex<Vec<Slot<M::Connection>>>,
    admission: Arc<Semaphore>,
    schema: OnceCell<()>,
    closed: AtomicBool,
    config: PoolConfig,
    created: AtomicUsize,
    discarded: AtomicUsize,
}

impl<M: ConnectionManager> Pool<M> {
    /// Create a pool. No connection is opened until the first acquire.
    pub fn new(manager: M, config: PoolConfig) -> Self {
        let capacity = config.max_connections.max(1);
        let slots = (0..capacity).map(|_| Slot::Empty).collect();

        Self {
            inner: Arc::new(PoolInner {
                manager,
                slots: Mutex::new(slots),
                admission: Arc::new(Semaphore::new(capacity)),
                schema: OnceCell::new(),
                closed: AtomicBool::new(false),
                config,
                created: AtomicUsize::new(0),
                discarded: AtomicUsize::new(0),
            }),
        }
    }

    /// Lease a connection, waiting at most `timeout` for a free slot.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection<M>, PoolError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let permit =
            match tokio::time::timeout(timeout, Arc::clone(&self.inner.admission).acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(PoolError::Closed),
                Err(_) => return Err(PoolError::Exhausted { timeout }),
            };

        let (index, idle) = self.inner.checkout().ok_or_else(|| {
            tracing::error!("Admission permit granted but every slot is leased");
            PoolError::Exhausted { timeout }
        })?;

        let mut conn = match idle {
            Some(conn) => conn,
            None => match self.inner.open().await {
                Ok(conn) => conn,
                Err(e) => {
                    self.inner.set_empty(index);
                    return Err(e.into());
                }
            },
        };

        if let Err(e) = self.inner.ensure_schema(&mut conn).await {
            tracing::error!(error = %e, "Backend schema setup failed");
            self.inner.check_in(index, conn).await;
            return Err(e.into());
        }

        Ok(PooledConnection {
            pool: Arc::clone(&self.inner),
            index,
            conn: Some(conn),
            permit: Some(permit),
        })
    }

    /// Acquire with the configured timeout, retrying exhaustion and backend
    /// failures a bounded number of times.
    pub async fn acquire_with_retry(&self) -> Result<PooledConnection<M>, PoolError> {
        let config = &self.inner.config;
        let attempts = config.acquire_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.acquire(config.acquire_timeout).await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    tracing::warn!(
                        attempt = attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Pool acquire failed, retrying"
                    );
                    tokio::time::sleep(config.retry_backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Close every idle connection. Leased connections are closed when they
    /// are released.
    pub async fn close(&self) {
        let idle = {
            let mut slots = self.inner.slots.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            let mut idle = Vec::new();
            for slot in slots.iter_mut() {
                if let Slot::Idle(_) = slot {
                    if let Slot::Idle(conn) = std::mem::replace(slot, Slot::Empty) {
                        idle.push(conn);
                    }
                }
            }
            idle
        };

        self.inner.admission.close();

        let count = idle.len();
        for conn in idle {
            self.inner.manager.close(conn).await;
        }

        tracing::info!(closed = count, "Backend pool closed");
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let slots = self.inner.slots.lock();
        PoolStats {
            capacity: slots.len(),
            in_use: slots.iter().filter(|s| matches!(s, Slot::Leased)).count(),
            idle: slots.iter().filter(|s| matches!(s, Slot::Idle(_))).count(),
            created: self.inner.created.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
        }
    }
}

impl<M: ConnectionManager> PoolInner<M> {
    /// Take an idle slot, or reserve an empty one for a lazy connect.
    fn checkout(&self) -> Option<(usize, Option<M::Connection>)> {
        let mut slots = self.slots.lock();

        if let Some(index) = slots.iter().position(|s| matches!(s, Slot::Idle(_))) {
            if let Slot::Idle(conn) = std::mem::replace(&mut slots[index], Slot::Leased) {
                return Some((index, Some(conn)));
            }
        }

        let index = slots.iter().position(|s| matches!(s, Slot::Empty))?;
        slots[index] = Slot::Leased;
        Some((index, None))
    }

    async fn open(&self) -> Result<M::Connection, StoreError> {
        let conn = self.manager.connect().await?;
        let total = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(created = total, "Opened backend connection");
        Ok(conn)
    }

    async fn ensure_schema(&self, conn: &mut M::Connection) -> Result<(), StoreError> {
        self.schema
            .get_or_try_init(|| async move { self.manager.initialize(conn).await })
            .await
            .map(|_| ())
    }

    /// Return a leased connection to its slot, replacing it if it is dead.
    async fn check_in(&self, index: usize, mut conn: M::Connection) {
        if !self.closed.load(Ordering::Acquire) && self.manager.is_valid(&mut conn).await {
            if let Some(conn) = self.park(index, conn) {
                self.manager.close(conn).await;
            }
            return;
        }

        self.manager.close(conn).await;
        if self.closed.load(Ordering::Acquire) {
            self.set_empty(index);
            return;
        }

        self.discarded.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(slot = index, "Discarded dead backend connection");

        match self.open().await {
            Ok(replacement) => {
                if let Some(conn) = self.park(index, replacement) {
                    self.manager.close(conn).await;
                }
            }
            Err(e) => {
                tracing::warn!(slot = index, error = %e, "Could not replace backend connection");
                self.set_empty(index);
            }
        }
    }

    /// Mark a slot idle. Hands the connection back if the pool closed
    /// in the meantime.
    fn park(&self, index: usize, conn: M::Connection) -> Option<M::Connection> {
        let mut slots = self.slots.lock();
        if self.closed.load(Ordering::Acquire) {
            slots[index] = Slot::Empty;
            return Some(conn);
        }
        slots[index] = Slot::Idle(conn);
        None
    }

    fn set_empty(&self, index: usize) {
        self.slots.lock()[index] = Slot::Empty;
    }

    /// Free a slot whose lease ended without a completed release
    fn abandon(&self, index: usize) {
        let mut slots = self.slots.lock();
        if matches!(slots[index], Slot::Leased) {
            slots[index] = Slot::Empty;
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A leased backend connection.
///
/// Call [`release`](Self::release) when done so the connection is probed and
/// reused. Dropping it instead discards the connection; the admission permit
/// is returned either way, exactly once.
pub struct PooledConnection<M: ConnectionManager> {
    pool: Arc<PoolInner<M>>,
    index: usize,
    conn: Option<M::Connection>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<M: ConnectionManager> PooledConnection<M> {
    /// Return the connection to the pool. Calling it again is a no-op.
    pub async fn release(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(self.index, conn).await;
        }
        self.permit.take();
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("pooled connection used after release")
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("pooled connection used after release")
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if self.permit.is_some() {
            if self.conn.take().is_some() {
                tracing::debug!(slot = self.index, "Pooled connection dropped without release");
            }
            self.pool.abandon(self.index);
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Slot count (maximum concurrent leases)
    pub capacity: usize,
    /// Currently leased connections
    pub in_use: usize,
    /// Open connections waiting in the pool
    pub idle: usize,
    /// Connections ever opened
    pub created: usize,
    /// Connections thrown away as dead or abandoned
    pub discarded: usize,
}
