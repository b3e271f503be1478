//! Connection facade used by request handlers and jobs
//!
//! [`Connector`] turns the raw pool into something a task can lean on: every
//! acquisition is health-checked, transient failures are retried with a
//! delay, and the connection is bound to a [`TaskScope`] so that nested
//! calls in the same unit of work reuse it. Dropping the scope hands the
//! connection back on every exit path, including errors, panics and
//! cancelled futures.

use crate::db::connection_manager::ConnectionFactory;
use crate::db::pool::{ConnectionId, ConnectionPool, PoolEntry, PoolError};
use crate::db::stats::ConnectionStats;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// How the pause between attempts grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryBackoff {
    /// Same delay after every failed attempt
    #[default]
    Fixed,
    /// Delay multiplied by the attempt number
    Linear,
}

/// Acquisition policy of a [`Connector`]
#[derive(Debug, Clone, PartialEq)]
pub struct AcquireSettings {
    /// Attempts before giving up; at least one is always made
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub backoff: RetryBackoff,
    /// How long one attempt waits for the pool
    pub connection_delay: Duration,
    /// Upper bound on the health ping
    pub health_check_timeout: Duration,
    /// When false every scope opens (and closes) its own connection
    pub use_pooling: bool,
}

impl Default for AcquireSettings {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            retry_delay: Duration::ZERO,
            backoff: RetryBackoff::Fixed,
            connection_delay: Duration::from_secs(2),
            health_check_timeout: Duration::from_secs(5),
            use_pooling: true,
        }
    }
}

impl AcquireSettings {
    /// Pause after the failed attempt with zero-based index `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            RetryBackoff::Fixed => self.retry_delay,
            RetryBackoff::Linear => self.retry_delay.saturating_mul(attempt.saturating_add(1)),
        }
    }
}

/// Shared entry point for tasks that need a database connection
pub struct Connector<F: ConnectionFactory> {
    pool: ConnectionPool<F>,
    settings: Arc<AcquireSettings>,
}

impl<F: ConnectionFactory> Clone for Connector<F> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for Connector<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("pool", &self.pool)
            .field("settings", &self.settings)
            .finish()
    }
}

impl<F: ConnectionFactory> Connector<F> {
    pub fn new(pool: ConnectionPool<F>, settings: AcquireSettings) -> Self {
        Self {
            pool,
            settings: Arc::new(settings),
        }
    }

    pub fn pool(&self) -> &ConnectionPool<F> {
        &self.pool
    }

    pub fn settings(&self) -> &AcquireSettings {
        &self.settings
    }

    /// Open a scope for one unit of work. The connection is acquired lazily
    /// on first use.
    pub fn scope(&self) -> TaskScope<F> {
        TaskScope {
            id: Uuid::new_v4(),
            connector: self.clone(),
            bound: None,
        }
    }

    /// Get a healthy connection, retrying transient failures.
    ///
    /// The caller owns the result and must give it back through
    /// [`Connector::release`]; [`TaskScope`] does that automatically.
    pub async fn acquire(&self) -> Result<PoolEntry<F::Connection>, PoolError> {
        self.acquire_for(Uuid::nil()).await
    }

    /// Return a connection after use, refreshing its last interaction.
    /// Connections opened without the pool are closed instead.
    pub fn release(&self, mut entry: PoolEntry<F::Connection>) {
        if !entry.is_pooled() {
            debug!(connection = %entry.id(), "Closing unpooled connection");
            return;
        }
        entry.stats_mut().touch();
        self.pool.release(entry);
    }

    pub fn close(&self) {
        self.pool.close();
    }

    #[instrument(skip(self), fields(use_pooling = self.settings.use_pooling))]
    async fn acquire_for(&self, scope: Uuid) -> Result<PoolEntry<F::Connection>, PoolError> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            match self.acquire_once().await {
                Ok(entry) => {
                    debug!(connection = %entry.id(), attempt, "Connection bound");
                    return Ok(entry);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(attempt, max_attempts, error = %e, "Connection attempt failed");
                    last_error = Some(e);
                }
            }

            if attempt + 1 < max_attempts {
                tokio::time::sleep(self.settings.delay_for(attempt)).await;
            }
        }

        Err(last_error.unwrap_or(PoolError::AcquireFailed))
    }

    async fn acquire_once(&self) -> Result<PoolEntry<F::Connection>, PoolError> {
        if self.pool.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        let mut entry = if self.settings.use_pooling {
            let waited = self.settings.connection_delay;
            self.pool
                .acquire(waited)
                .await?
                .ok_or(PoolError::PoolExhausted { waited })?
        } else {
            let connection = self
                .pool
                .factory()
                .connect()
                .await
                .map_err(|e| PoolError::ConstructionFailed(Box::new(e)))?;
            PoolEntry::detached(connection)
        };

        let timeout = self.settings.health_check_timeout;
        let ping = tokio::time::timeout(
            timeout,
            self.pool.factory().ping(entry.connection_mut()),
        )
        .await;

        let reason = match ping {
            Ok(Ok(1)) => return Ok(entry),
            Ok(Ok(rows)) => format!("ping returned {rows} rows"),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("ping timed out after {timeout:?}"),
        };

        // Broken connections never go back to the pool
        self.pool.discard(entry);
        Err(PoolError::HealthCheckFailed(reason))
    }
}

/// Future returned by a statement run through [`TaskScope::execute`]
pub type ScopedFuture<'c, T> = Pin<Box<dyn Future<Output = T> + Send + 'c>>;

/// Per-task binding of at most one connection
///
/// Pass the scope down the call chain; every call to
/// [`connection`](TaskScope::connection) within it sees the same connection.
pub struct TaskScope<F: ConnectionFactory> {
    id: Uuid,
    connector: Connector<F>,
    bound: Option<PoolEntry<F::Connection>>,
}

impl<F: ConnectionFactory> TaskScope<F> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    /// Run one statement on the scope's connection and count it against the
    /// connection's usage limit, whatever the statement returns.
    ///
    /// ```ignore
    /// let rows = scope
    ///     .execute(|conn| Box::pin(async move { conn.execute("SELECT 1", &[]).await }))
    ///     .await??;
    /// ```
    pub async fn execute<T, Q>(&mut self, statement: Q) -> Result<T, PoolError>
    where
        Q: for<'c> FnOnce(&'c mut F::Connection) -> ScopedFuture<'c, T>,
    {
        let connection = self.connection().await?;
        let output = statement(connection).await;
        self.record_use();
        Ok(output)
    }

    /// The scope's connection, acquiring one on first use.
    ///
    /// Statements issued directly on the returned handle are not counted;
    /// use [`execute`](TaskScope::execute) or call
    /// [`record_use`](TaskScope::record_use) for them.
    pub async fn connection(&mut self) -> Result<&mut F::Connection, PoolError> {
        if self.bound.is_none() {
            let entry = self.connector.acquire_for(self.id).await?;
            self.bound = Some(entry);
        }

        self.bound
            .as_mut()
            .map(PoolEntry::connection_mut)
            .ok_or_else(|| PoolError::CorruptedState("task binding vanished".to_string()))
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.bound.as_ref().map(PoolEntry::id)
    }

    pub fn stats(&self) -> Option<&ConnectionStats> {
        self.bound.as_ref().map(PoolEntry::stats)
    }

    /// Count one statement issued outside [`execute`](TaskScope::execute)
    pub fn record_use(&mut self) {
        if let Some(entry) = self.bound.as_mut() {
            entry.stats_mut().record_use();
        }
    }

    /// Give the connection back before the scope ends
    pub fn release(&mut self) {
        if let Some(entry) = self.bound.take() {
            debug!(scope = %self.id, connection = %entry.id(), "Releasing task connection");
            self.connector.release(entry);
        }
    }
}

impl<F: ConnectionFactory> Drop for TaskScope<F> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<F: ConnectionFactory> fmt::Debug for TaskScope<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScope")
            .field("id", &self.id)
            .field("connection", &self.connection_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::PoolSettings;
    use crate::test_helpers::MockFactory;

    fn connector(factory: MockFactory, size: usize, settings: AcquireSettings) -> Connector<MockFactory> {
        let pool = ConnectionPool::new(factory, PoolSettings::new(size)).unwrap();
        Connector::new(pool, settings)
    }

    #[test]
    fn test_backoff_delays() {
        let mut settings = AcquireSettings {
            retry_delay: Duration::from_millis(100),
            ..AcquireSettings::default()
        };
        assert_eq!(settings.delay_for(0), Duration::from_millis(100));
        assert_eq!(settings.delay_for(3), Duration::from_millis(100));

        settings.backoff = RetryBackoff::Linear;
        assert_eq!(settings.delay_for(0), Duration::from_millis(100));
        assert_eq!(settings.delay_for(2), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_nested_calls_reuse_binding() {
        let factory = MockFactory::new();
        let connector = connector(factory.clone(), 2, AcquireSettings::default());

        let mut scope = connector.scope();
        assert!(!scope.is_bound());
        let first = scope.connection().await.unwrap().id;
        let second = scope.connection().await.unwrap().id;
        assert_eq!(first, second);
        assert_eq!(factory.connects(), 1);
        assert_eq!(factory.pings(), 1);
        assert_eq!(connector.pool().length(), 0);

        drop(scope);
        assert_eq!(connector.pool().length(), 1);
    }

    #[tokio::test]
    async fn test_scope_release_refreshes_last_interaction() {
        let connector = connector(MockFactory::new(), 1, AcquireSettings::default());
        let mut scope = connector.scope();
        scope.connection().await.unwrap();
        let before = scope.stats().unwrap().last_interaction;
        scope.release();
        assert!(!scope.is_bound());

        let entry = connector.pool().acquire(Duration::from_millis(10)).await.unwrap().unwrap();
        assert!(entry.stats().last_interaction >= before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_surfaces_last_error() {
        let settings = AcquireSettings {
            max_attempts: 3,
            retry_delay: Duration::from_millis(10),
            connection_delay: Duration::from_millis(20),
            ..AcquireSettings::default()
        };
        let connector = connector(MockFactory::new(), 1, settings);
        let mut holder = connector.scope();
        holder.connection().await.unwrap();

        let mut waiter = connector.scope();
        let err = waiter.connection().await.unwrap_err();
        assert!(matches!(err, PoolError::PoolExhausted { .. }));
        assert!(!waiter.is_bound());
    }

    #[tokio::test]
    async fn test_execute_counts_every_statement() {
        let factory = MockFactory::new();
        let pool = ConnectionPool::new(factory.clone(), PoolSettings::new(1).with_usage_limit(3))
            .unwrap();
        let connector = Connector::new(pool, AcquireSettings::default());

        let mut scope = connector.scope();
        for _ in 0..2 {
            let rows = scope
                .execute(|conn| Box::pin(async move { conn.query("SELECT 1") }))
                .await
                .unwrap();
            assert_eq!(rows, 1);
        }
        assert_eq!(scope.stats().unwrap().counter, 3);
        drop(scope);
        // At the limit, not past it
        assert_eq!(connector.pool().length(), 1);

        let mut scope = connector.scope();
        scope
            .execute(|conn| Box::pin(async move { conn.query("SELECT 1") }))
            .await
            .unwrap();
        drop(scope);
        assert_eq!(connector.pool().capacity(), 0);
        assert_eq!(factory.dropped(), 1);
    }

    #[tokio::test]
    async fn test_construction_failures_are_retried() {
        let factory = MockFactory::new();
        factory.fail_next_connects(2);
        let settings = AcquireSettings {
            max_attempts: 3,
            ..AcquireSettings::default()
        };
        let connector = connector(factory.clone(), 1, settings);

        let entry = connector.acquire().await.unwrap();
        assert_eq!(factory.connects(), 1);
        assert_eq!(connector.pool().stats().total_errors, 2);
        connector.release(entry);
    }

    #[tokio::test]
    async fn test_persistent_construction_failure_surfaces() {
        let factory = MockFactory::new();
        factory.fail_next_connects(3);
        let settings = AcquireSettings {
            max_attempts: 3,
            ..AcquireSettings::default()
        };
        let connector = connector(factory.clone(), 1, settings);

        let err = connector.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::ConstructionFailed(_)));
        assert_eq!(connector.pool().capacity(), 0);
        assert_eq!(connector.pool().stats().total_errors, 3);
        assert_eq!(factory.connects(), 0);
    }

    #[tokio::test]
    async fn test_health_check_error_is_retried() {
        let factory = MockFactory::new();
        factory.error_next_pings(1);
        let settings = AcquireSettings {
            max_attempts: 2,
            ..AcquireSettings::default()
        };
        let connector = connector(factory.clone(), 1, settings);

        let entry = connector.acquire().await.unwrap();
        assert_eq!(factory.connects(), 2);
        assert_eq!(factory.dropped(), 1);
        connector.release(entry);
        assert_eq!(connector.pool().length(), 1);
    }

    #[tokio::test]
    async fn test_single_attempt_reports_health_failure() {
        let factory = MockFactory::new();
        factory.fail_next_pings(1);
        let connector = connector(factory.clone(), 1, AcquireSettings::default());

        let err = connector.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::HealthCheckFailed(ref r) if r.contains("0 rows")));
        assert_eq!(connector.pool().capacity(), 0);
    }

    #[tokio::test]
    async fn test_closed_pool_is_not_retried() {
        let factory = MockFactory::new();
        let settings = AcquireSettings {
            max_attempts: 5,
            retry_delay: Duration::from_secs(60),
            ..AcquireSettings::default()
        };
        let connector = connector(factory.clone(), 1, settings);
        connector.close();

        let started = tokio::time::Instant::now();
        let err = connector.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::PoolClosed));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(factory.connects(), 0);
    }

    #[tokio::test]
    async fn test_unpooled_mode_bypasses_pool() {
        let factory = MockFactory::new();
        let settings = AcquireSettings {
            use_pooling: false,
            ..AcquireSettings::default()
        };
        let connector = connector(factory.clone(), 1, settings);

        {
            let mut scope = connector.scope();
            scope.connection().await.unwrap().query("SELECT 1");
            scope.record_use();
            assert_eq!(scope.stats().unwrap().counter, 2);
        }

        let mut scope = connector.scope();
        scope.connection().await.unwrap();
        drop(scope);

        assert_eq!(factory.connects(), 2);
        assert_eq!(factory.dropped(), 2);
        assert_eq!(connector.pool().capacity(), 0);
        assert_eq!(connector.pool().length(), 0);
    }

    #[tokio::test]
    async fn test_scope_released_when_task_panics() {
        let connector = connector(MockFactory::new(), 1, AcquireSettings::default());

        let task_connector = connector.clone();
        let result = tokio::spawn(async move {
            let mut scope = task_connector.scope();
            scope.connection().await.unwrap();
            panic!("handler failed");
        })
        .await;

        assert!(result.is_err());
        assert_eq!(connector.pool().length(), 1);
        assert_eq!(connector.pool().capacity(), 1);
    }
}
