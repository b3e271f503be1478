pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod logging;
pub mod server;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use config::Config;
pub use db::{
    AcquireSettings, ConnectionFactory, ConnectionPool, ConnectionStats, Connector, Downscaler,
    PoolEntry, PoolError, PoolSettings, TaskScope,
};
pub use error::{DbalError, Result};
