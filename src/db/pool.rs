//! Bounded connection pool
//!
//! Idle connections sit in a FIFO queue guarded by a short-lived mutex; a
//! semaphore mirrors the queue length so waiters suspend on the tokio
//! scheduler instead of spinning. Every connection travels together with its
//! [`ConnectionStats`] as one [`PoolEntry`], so there is no side table to keep
//! in sync.

use crate::db::connection_manager::ConnectionFactory;
use crate::db::stats::ConnectionStats;
use crate::error::BoxError;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{AcquireError, Notify, Semaphore, SemaphorePermit, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur with the connection pool
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("No connection available in pool after {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("Connection health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Failed to construct connection: {0}")]
    ConstructionFailed(#[source] BoxError),

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Connection pool state is corrupted: {0}")]
    CorruptedState(String),

    #[error("Connection could not be acquired")]
    AcquireFailed,

    #[error("Pool configuration error: {0}")]
    Configuration(String),
}

impl PoolError {
    /// Transient failures are absorbed by the retry loop; everything else
    /// surfaces to the caller immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::PoolExhausted { .. }
                | PoolError::HealthCheckFailed(_)
                | PoolError::ConstructionFailed(_)
                | PoolError::AcquireFailed
        )
    }
}

/// Identity of a connection for as long as it lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A connection together with the stats that decide its retirement
pub struct PoolEntry<C> {
    id: ConnectionId,
    connection: C,
    stats: ConnectionStats,
    pooled: bool,
}

impl<C> PoolEntry<C> {
    /// Wrap a connection that was opened outside of any pool.
    pub fn detached(connection: C) -> Self {
        static NEXT_DETACHED: AtomicU64 = AtomicU64::new(1);
        Self {
            id: ConnectionId(NEXT_DETACHED.fetch_add(1, Ordering::Relaxed)),
            connection,
            stats: ConnectionStats::unlimited(),
            pooled: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut ConnectionStats {
        &mut self.stats
    }
}

impl<C> fmt::Debug for PoolEntry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("id", &self.id)
            .field("stats", &self.stats)
            .field("pooled", &self.pooled)
            .finish()
    }
}

/// Retirement policy applied to every connection the pool creates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolSettings {
    /// Maximum number of connections issued at once
    pub max_size: usize,
    /// Idle time after which a connection is retired
    pub connection_ttl: Option<Duration>,
    /// Number of uses after which a connection is retired
    pub usage_limit: Option<u64>,
}

impl PoolSettings {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.connection_ttl = Some(ttl);
        self
    }

    pub fn with_usage_limit(mut self, limit: u64) -> Self {
        self.usage_limit = Some(limit);
        self
    }
}

/// Point-in-time view of the pool for monitoring
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    /// Configured ceiling of issued connections
    pub max_size: usize,
    /// Connections created and not yet destroyed
    pub issued: usize,
    /// Connections waiting in the pool
    pub idle: usize,
    /// Connections held by callers
    pub in_use: usize,
    /// Total connections created since pool start
    pub total_created: u64,
    /// Total connections destroyed since pool start
    pub total_destroyed: u64,
    /// Total connection construction failures
    pub total_errors: u64,
    pub closed: bool,
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    settings: PoolSettings,
    idle: Mutex<VecDeque<PoolEntry<F::Connection>>>,
    /// One permit per idle entry
    available: Semaphore,
    /// Signalled whenever an issued slot is given back
    slot_freed: Notify,
    issued: AtomicUsize,
    next_id: AtomicU64,
    total_created: AtomicU64,
    total_destroyed: AtomicU64,
    total_errors: AtomicU64,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

/// Bounded pool of connections produced by a [`ConnectionFactory`]
///
/// Cloning is cheap and every clone refers to the same pool.
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("settings", &self.inner.settings)
            .field("issued", &self.capacity())
            .field("idle", &self.length())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create an empty pool. Connections are opened lazily on demand.
    pub fn new(factory: F, settings: PoolSettings) -> Result<Self, PoolError> {
        if settings.max_size == 0 {
            return Err(PoolError::Configuration(
                "pool size must be greater than zero".to_string(),
            ));
        }

        info!(
            max_size = settings.max_size,
            ttl = ?settings.connection_ttl,
            usage_limit = ?settings.usage_limit,
            "Creating connection pool"
        );

        let (closed_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(PoolInner {
                factory,
                idle: Mutex::new(VecDeque::with_capacity(settings.max_size)),
                settings,
                available: Semaphore::new(0),
                slot_freed: Notify::new(),
                issued: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                total_created: AtomicU64::new(0),
                total_destroyed: AtomicU64::new(0),
                total_errors: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                closed_tx,
            }),
        })
    }

    /// Get an idle connection, opening a new one first when the pool is
    /// empty and still under its ceiling.
    ///
    /// While waiting, a slot freed by a destroyed connection lets the caller
    /// open a fresh one instead of waiting for an idle connection that may
    /// never come back.
    ///
    /// `Ok(None)` means nothing became available within `timeout`; that is
    /// an expected outcome under load, not a failure.
    #[instrument(skip(self))]
    pub async fn acquire(
        &self,
        timeout: Duration,
    ) -> Result<Option<PoolEntry<F::Connection>>, PoolError> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.is_closed() {
                return Err(PoolError::PoolClosed);
            }

            // Registered before growing so a slot freed meanwhile is not missed
            let slot_freed = self.inner.slot_freed.notified();
            tokio::pin!(slot_freed);
            slot_freed.as_mut().enable();

            if self.length() == 0 {
                self.grow().await?;
            }

            tokio::select! {
                biased;
                permit = self.inner.available.acquire() => return self.claim(permit),
                _ = slot_freed.as_mut() => {
                    debug!("Pool slot freed, retrying growth");
                }
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(?timeout, "No connection within timeout");
                    return Ok(None);
                }
            }
        }
    }

    /// Wait up to `timeout` for an idle connection without ever opening a
    /// new one.
    pub async fn take_idle(
        &self,
        timeout: Duration,
    ) -> Result<Option<PoolEntry<F::Connection>>, PoolError> {
        match tokio::time::timeout(timeout, self.inner.available.acquire()).await {
            Ok(permit) => self.claim(permit),
            Err(_) => {
                debug!(?timeout, "No idle connection within timeout");
                Ok(None)
            }
        }
    }

    /// Turn an idle permit into the entry it stands for
    fn claim(
        &self,
        permit: Result<SemaphorePermit<'_>, AcquireError>,
    ) -> Result<Option<PoolEntry<F::Connection>>, PoolError> {
        let Ok(permit) = permit else {
            return Err(PoolError::PoolClosed);
        };
        permit.forget();

        let next = self.lock_idle().pop_front();
        match next {
            Some(entry) => {
                debug!(connection = %entry.id, "Connection checked out");
                Ok(Some(entry))
            }
            // close() drains the queue before the permit could be used
            None if self.is_closed() => Err(PoolError::PoolClosed),
            None => Err(PoolError::CorruptedState(
                "idle permit granted without an idle connection".to_string(),
            )),
        }
    }

    /// Hand a connection back to the pool.
    ///
    /// The connection is destroyed instead when the pool is closed, when its
    /// stats say it is overdue, or when the idle queue is already full. This
    /// never blocks.
    pub fn release(&self, entry: PoolEntry<F::Connection>) {
        if !entry.pooled {
            warn!(connection = %entry.id, "Refusing to pool a detached connection");
            return;
        }
        if entry.stats.is_overdue() {
            debug!(connection = %entry.id, counter = entry.stats.counter, "Retiring overdue connection");
            self.destroy(entry);
            return;
        }

        let mut idle = self.lock_idle();
        if self.is_closed() || idle.len() >= self.inner.settings.max_size {
            drop(idle);
            self.destroy(entry);
            return;
        }
        debug!(connection = %entry.id, "Connection returned to pool");
        idle.push_back(entry);
        drop(idle);
        self.inner.available.add_permits(1);
    }

    /// Destroy a checked-out connection and free its slot.
    pub fn discard(&self, entry: PoolEntry<F::Connection>) {
        debug!(connection = %entry.id, "Discarding connection");
        if entry.pooled {
            self.destroy(entry);
        }
    }

    /// Number of connections issued and not yet destroyed
    pub fn capacity(&self) -> usize {
        self.inner.issued.load(Ordering::Acquire)
    }

    /// Number of idle connections ready to be taken
    pub fn length(&self) -> usize {
        self.lock_idle().len()
    }

    pub fn max_size(&self) -> usize {
        self.inner.settings.max_size
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Receiver that flips to `true` once the pool is closed
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.inner.closed_tx.subscribe()
    }

    /// Close the pool. Waiters wake up with [`PoolError::PoolClosed`], idle
    /// connections are dropped, and connections released later are
    /// destroyed. Safe to call more than once.
    #[instrument(skip(self))]
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut idle = self.lock_idle();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            self.inner.available.close();
            idle.drain(..).collect()
        };

        info!(idle = drained.len(), "Shutting down connection pool");
        for entry in drained {
            self.destroy(entry);
        }
        self.inner.closed_tx.send_replace(true);
    }

    pub fn stats(&self) -> PoolStats {
        let issued = self.capacity();
        let idle = self.length();
        PoolStats {
            max_size: self.max_size(),
            issued,
            idle,
            in_use: issued.saturating_sub(idle),
            total_created: self.inner.total_created.load(Ordering::Relaxed),
            total_destroyed: self.inner.total_destroyed.load(Ordering::Relaxed),
            total_errors: self.inner.total_errors.load(Ordering::Relaxed),
            closed: self.is_closed(),
        }
    }

    /// Open one connection if a slot is free and park it in the idle queue.
    async fn grow(&self) -> Result<(), PoolError> {
        if !self.reserve_slot() {
            return Ok(());
        }

        let connection = match self.inner.factory.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                self.inner.issued.fetch_sub(1, Ordering::AcqRel);
                self.inner.slot_freed.notify_waiters();
                self.inner.total_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to open connection: {}", e);
                return Err(PoolError::ConstructionFailed(Box::new(e)));
            }
        };

        let entry = PoolEntry {
            id: ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed)),
            connection,
            stats: ConnectionStats::new(
                self.inner.settings.connection_ttl,
                self.inner.settings.usage_limit,
            ),
            pooled: true,
        };
        self.inner.total_created.fetch_add(1, Ordering::Relaxed);
        debug!(connection = %entry.id, issued = self.capacity(), "Opened new connection");

        let mut idle = self.lock_idle();
        if self.is_closed() {
            drop(idle);
            self.destroy(entry);
            return Err(PoolError::PoolClosed);
        }
        idle.push_back(entry);
        drop(idle);
        self.inner.available.add_permits(1);
        Ok(())
    }

    /// Compare-and-increment admission gate on the issued count.
    fn reserve_slot(&self) -> bool {
        let max_size = self.inner.settings.max_size;
        self.inner
            .issued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |issued| {
                (issued < max_size).then_some(issued + 1)
            })
            .is_ok()
    }

    fn destroy(&self, entry: PoolEntry<F::Connection>) {
        let released = self
            .inner
            .issued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |issued| {
                issued.checked_sub(1)
            })
            .is_ok();
        if !released {
            warn!(connection = %entry.id, "Destroyed a connection the pool no longer tracked");
        }
        self.inner.total_destroyed.fetch_add(1, Ordering::Relaxed);
        drop(entry);
        if released {
            self.inner.slot_freed.notify_waiters();
        }
    }

    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<PoolEntry<F::Connection>>> {
        // The queue stays structurally valid even if a holder panicked
        self.inner
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
