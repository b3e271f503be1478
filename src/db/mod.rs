//! Database connection pooling module
//!
//! This module provides a bounded connection pool with per-connection TTL
//! and usage limits, a retrying task-scoped acquisition facade, and a
//! background downscaler that evicts overdue idle connections.

pub mod connection_manager;
pub mod connector;
pub mod downscaler;
pub mod pool;
pub mod stats;

pub use connection_manager::{
    ConnectionFactory, ConnectionManagerError, PgConnectionConfig, PgConnectionFactory,
};
pub use connector::{AcquireSettings, Connector, RetryBackoff, TaskScope};
pub use downscaler::{Downscaler, DownscalerState, SweepReport};
pub use pool::{ConnectionId, ConnectionPool, PoolEntry, PoolError, PoolSettings, PoolStats};
pub use stats::ConnectionStats;
