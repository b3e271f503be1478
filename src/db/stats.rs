//! Per-connection bookkeeping used to decide when a pooled connection
//! must be retired.

use std::time::Duration;
use tokio::time::Instant;

/// Usage and age metadata that travels with every pooled connection.
///
/// `is_overdue` is re-evaluated each time it is called; nothing here is
/// cached, so a connection that crosses its TTL while idle is caught by the
/// next release or downscaler sweep that looks at it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStats {
    /// Last time the connection was handed back by a caller
    pub last_interaction: Instant,
    /// Number of uses recorded so far (starts at 1 on creation)
    pub counter: u64,
    ttl: Option<Duration>,
    usage_limit: Option<u64>,
}

impl ConnectionStats {
    /// Stats for a freshly created connection.
    ///
    /// A zero TTL or zero usage limit means "not configured".
    pub fn new(ttl: Option<Duration>, usage_limit: Option<u64>) -> Self {
        Self {
            last_interaction: Instant::now(),
            counter: 1,
            ttl: ttl.filter(|t| !t.is_zero()),
            usage_limit: usage_limit.filter(|l| *l > 0),
        }
    }

    /// Stats with no retirement policy, used for connections that never
    /// enter the pool.
    pub fn unlimited() -> Self {
        Self::new(None, None)
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn usage_limit(&self) -> Option<u64> {
        self.usage_limit
    }

    /// True when the usage counter went past the limit or the connection
    /// has been idle for longer than its TTL.
    pub fn is_overdue(&self) -> bool {
        let counter_overflow = self
            .usage_limit
            .is_some_and(|limit| self.counter > limit);
        let ttl_overdue = self.ttl.is_some_and(|ttl| self.idle_for() > ttl);

        counter_overflow || ttl_overdue
    }

    /// True once the connection has been used as many times as allowed.
    ///
    /// Stricter than [`is_overdue`](Self::is_overdue): a connection at
    /// exactly its limit is exhausted but not yet overdue.
    pub fn is_exhausted(&self) -> bool {
        self.usage_limit.is_some_and(|limit| self.counter >= limit)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_interaction.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_interaction = Instant::now();
    }

    pub fn record_use(&mut self) {
        self.counter = self.counter.saturating_add(1);
    }
}
