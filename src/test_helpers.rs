//! In-memory connection factory for exercising the pool without a database
//!
//! `MockFactory` hands out [`MockConnection`]s and records what happened to
//! them: how many were opened, pinged and dropped, and the highest number
//! that were alive at once. Failures can be scripted ahead of time.
//!
//! # Usage
//!
//! ```rust
//! use dbal_pool::test_helpers::MockFactory;
//! use dbal_pool::db::{ConnectionPool, PoolSettings};
//!
//! let factory = MockFactory::new();
//! factory.fail_next_pings(1);
//! let pool = ConnectionPool::new(factory.clone(), PoolSettings::new(2)).unwrap();
//! assert_eq!(pool.capacity(), 0);
//! ```

use crate::db::ConnectionFactory;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MockError {
    #[error("mock connection refused")]
    Refused,

    #[error("mock connection reset")]
    Reset,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: AtomicUsize,
    connects: AtomicUsize,
    pings: AtomicUsize,
    dropped: AtomicUsize,
    live: AtomicUsize,
    peak_live: AtomicUsize,
    fail_connects: AtomicUsize,
    broken_pings: AtomicUsize,
    error_pings: AtomicUsize,
}

impl MockState {
    fn open(self: &Arc<Self>) -> MockConnection {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_live.fetch_max(live, Ordering::SeqCst);
        MockConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            queries: 0,
            state: Arc::clone(self),
        }
    }

    /// Decrement a scripted-failure budget, returning whether one was used
    fn take_budget(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Connection handed out by [`MockFactory`]
#[derive(Debug)]
pub struct MockConnection {
    /// Sequence number, unique per factory
    pub id: usize,
    /// Queries issued through [`MockConnection::query`]
    pub queries: u64,
    state: Arc<MockState>,
}

impl MockConnection {
    /// Pretend to run a statement
    pub fn query(&mut self, _sql: &str) -> u64 {
        self.queries += 1;
        1
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.state.live.fetch_sub(1, Ordering::SeqCst);
        self.state.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scriptable factory; clones share the same counters
#[derive(Debug, Clone, Default)]
pub struct MockFactory {
    state: Arc<MockState>,
    connect_delay: Duration,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `connect` take this long, to widen race windows
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// The next `n` connects fail with [`MockError::Refused`]
    pub fn fail_next_connects(&self, n: usize) {
        self.state.fail_connects.store(n, Ordering::SeqCst);
    }

    /// The next `n` pings answer with zero rows
    pub fn fail_next_pings(&self, n: usize) {
        self.state.broken_pings.store(n, Ordering::SeqCst);
    }

    /// The next `n` pings fail with [`MockError::Reset`]
    pub fn error_next_pings(&self, n: usize) {
        self.state.error_pings.store(n, Ordering::SeqCst);
    }

    /// Open a connection without going through `connect`
    pub fn open_detached(&self) -> MockConnection {
        self.state.open()
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.state.dropped.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn peak_live(&self) -> usize {
        self.state.peak_live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;
    type Error = MockError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if MockState::take_budget(&self.state.fail_connects) {
            return Err(MockError::Refused);
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.open())
    }

    async fn ping(&self, _conn: &mut Self::Connection) -> Result<u64, Self::Error> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if MockState::take_budget(&self.state.error_pings) {
            return Err(MockError::Reset);
        }
        if MockState::take_budget(&self.state.broken_pings) {
            return Ok(0);
        }
        Ok(1)
    }
}
