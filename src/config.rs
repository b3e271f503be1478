use crate::db::{AcquireSettings, PgConnectionConfig, PoolSettings, RetryBackoff};
use anyhow::{Context, Result, bail};
use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const REDACTED: &str = "********";

/// Main configuration structure for the pool service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub pool: PoolConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// PostgreSQL connection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Full connection URL; overrides the discrete fields when set
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub connect_timeout_secs: u64,
}

/// Pool sizing, retirement and retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of connections issued at once
    pub pool_size: usize,
    /// Idle seconds before a connection is retired (0 disables)
    pub connection_ttl_secs: u64,
    /// Queries per connection before it is retired (0 disables)
    pub usage_limit: u64,
    /// Seconds one attempt waits for a pooled connection
    pub connection_delay_secs: f64,
    pub health_check_timeout_secs: u64,
    /// Interval between downscaler sweeps
    pub tick_frequency_ms: u64,
    /// Let the downscaler also retire connections at their usage limit
    pub retire_exhausted: bool,
    /// False opens a dedicated connection per task
    pub use_pooling: bool,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub backoff: RetryBackoff,
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub target: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let defaults = PgConnectionConfig::default();
        Self {
            url: None,
            host: defaults.host,
            port: defaults.port,
            dbname: defaults.dbname,
            user: defaults.user,
            password: defaults.password,
            connect_timeout_secs: defaults.connect_timeout_secs,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            connection_ttl_secs: 60,
            usage_limit: 0,
            connection_delay_secs: 2.0,
            health_check_timeout_secs: 5,
            tick_frequency_ms: 60 * 60 * 1000,
            retire_exhausted: false,
            use_pooling: true,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
            backoff: RetryBackoff::Fixed,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9501,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(), // pretty, json, compact
            target: "stdout".to_string(), // stdout, stderr
        }
    }
}

impl DatabaseConfig {
    pub fn to_connection_config(&self) -> PgConnectionConfig {
        PgConnectionConfig {
            url: self.url.clone().filter(|url| !url.is_empty()),
            host: self.host.clone(),
            port: self.port,
            dbname: self.dbname.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            connect_timeout_secs: self.connect_timeout_secs,
        }
    }
}

impl PoolConfig {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_size: self.pool_size,
            connection_ttl: (self.connection_ttl_secs > 0)
                .then(|| Duration::from_secs(self.connection_ttl_secs)),
            usage_limit: (self.usage_limit > 0).then_some(self.usage_limit),
        }
    }

    pub fn acquire_settings(&self) -> Result<AcquireSettings> {
        let connection_delay = Duration::try_from_secs_f64(self.connection_delay_secs)
            .with_context(|| {
                format!("invalid connection_delay_secs: {}", self.connection_delay_secs)
            })?;

        Ok(AcquireSettings {
            max_attempts: self.retry.max_attempts,
            retry_delay: Duration::from_millis(self.retry.delay_ms),
            backoff: self.retry.backoff,
            connection_delay,
            health_check_timeout: Duration::from_secs(self.health_check_timeout_secs),
            use_pooling: self.use_pooling,
        })
    }

    pub fn tick_frequency(&self) -> Duration {
        Duration::from_millis(self.tick_frequency_ms)
    }
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (DBAL_POOL_<SECTION>__<KEY>, DATABASE_URL)
    /// 2. config.toml file (if exists)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_dir(&std::env::current_dir()?)
    }

    /// Load configuration from a specific directory
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        let config_file = dir.join("config.toml");
        if config_file.exists() {
            builder = builder.add_source(File::from(config_file));
        }

        builder = builder.add_source(
            Environment::with_prefix("DBAL_POOL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut result: Config = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        result.merge_env_vars();
        result.validate()?;

        Ok(result)
    }

    /// Reject settings the pool cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pool.pool_size == 0 {
            bail!("pool.pool_size must be greater than zero");
        }
        if self.pool.retry.max_attempts == 0 {
            bail!("pool.retry.max_attempts must be at least 1");
        }
        if self.pool.tick_frequency_ms == 0 {
            bail!("pool.tick_frequency_ms must be greater than zero");
        }
        self.pool.acquire_settings()?;
        Ok(())
    }

    /// Copy safe to print: credentials are masked
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.database.password = REDACTED.to_string();
        if copy.database.url.is_some() {
            copy.database.url = Some(REDACTED.to_string());
        }
        copy
    }

    /// Create a new Config for testing
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            database: DatabaseConfig {
                url: None,
                host: "localhost".to_string(),
                port: 5432,
                dbname: "test".to_string(),
                user: "test".to_string(),
                password: "test".to_string(),
                connect_timeout_secs: 1,
            },
            pool: PoolConfig {
                pool_size: 2,
                tick_frequency_ms: 1000,
                ..PoolConfig::default()
            },
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Use any available port
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                format: "pretty".to_string(),
                target: "stdout".to_string(),
            },
        }
    }

    /// Conventional variables understood by most PostgreSQL tooling
    fn merge_env_vars(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.is_empty() {
                self.database.url = Some(url);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs::write;
    use std::sync::Mutex;
    use tempfile::TempDir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const MANAGED_VARS: &[&str] = &[
        "DATABASE_URL",
        "DBAL_POOL_DATABASE__HOST",
        "DBAL_POOL_DATABASE__USER",
        "DBAL_POOL_DATABASE__PASSWORD",
        "DBAL_POOL_POOL__POOL_SIZE",
        "DBAL_POOL_POOL__USE_POOLING",
        "DBAL_POOL_POOL__RETRY__MAX_ATTEMPTS",
        "DBAL_POOL_SERVER__PORT",
    ];

    // Helper to create isolated environment for testing
    fn with_isolated_env<T>(f: impl FnOnce() -> T) -> T {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let saved: Vec<_> = MANAGED_VARS
            .iter()
            .map(|key| (*key, env::var(key).ok()))
            .collect();

        unsafe {
            for key in MANAGED_VARS {
                env::remove_var(key);
            }
        }

        let result = f();

        unsafe {
            for (key, value) in saved {
                match value {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }

        result
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::default();

        assert_eq!(config.database.host, "127.0.0.1");
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.database.dbname, "postgres");
        assert_eq!(config.pool.pool_size, 8);
        assert_eq!(config.pool.connection_ttl_secs, 60);
        assert_eq!(config.pool.usage_limit, 0);
        assert_eq!(config.pool.retry.max_attempts, 1);
        assert_eq!(config.pool.tick_frequency(), Duration::from_secs(3600));
        assert!(config.pool.use_pooling);
        assert!(!config.pool.retire_exhausted);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_for_testing() {
        let config = Config::for_testing();

        assert_eq!(config.database.user, "test");
        assert_eq!(config.pool.pool_size, 2);
        assert_eq!(config.server.port, 0);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_settings_conversion() {
        let mut pool = PoolConfig::default();
        pool.usage_limit = 100;
        pool.connection_ttl_secs = 0;
        pool.connection_delay_secs = 0.5;
        pool.retry = RetryConfig {
            max_attempts: 3,
            delay_ms: 250,
            backoff: RetryBackoff::Linear,
        };

        let settings = pool.pool_settings();
        assert_eq!(settings.max_size, 8);
        assert_eq!(settings.connection_ttl, None);
        assert_eq!(settings.usage_limit, Some(100));

        let acquire = pool.acquire_settings().unwrap();
        assert_eq!(acquire.max_attempts, 3);
        assert_eq!(acquire.retry_delay, Duration::from_millis(250));
        assert_eq!(acquire.connection_delay, Duration::from_millis(500));
        assert_eq!(acquire.backoff, RetryBackoff::Linear);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.pool.pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.connection_delay_secs = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_masks_credentials() {
        let mut config = Config::default();
        config.database.url = Some("postgres://u:secret@h/db".to_string());
        let redacted = config.redacted();
        assert_eq!(redacted.database.password, REDACTED);
        assert_eq!(redacted.database.url.as_deref(), Some(REDACTED));
        assert_eq!(redacted.pool, config.pool);
    }

    #[test]
    fn test_load_from_toml_file() -> Result<()> {
        with_isolated_env(|| -> Result<()> {
            let temp_dir = TempDir::new()?;
            let config_content = r#"
[database]
host = "db.internal"
port = 5433
dbname = "app"
user = "app"
password = "secret"

[pool]
pool_size = 5
connection_ttl_secs = 30
usage_limit = 100
connection_delay_secs = 1.5
tick_frequency_ms = 60000
retire_exhausted = true

[pool.retry]
max_attempts = 2
delay_ms = 1000
backoff = "linear"

[server]
port = 8080
"#;
            write(temp_dir.path().join("config.toml"), config_content)?;

            let config = Config::load_from_dir(temp_dir.path())?;

            assert_eq!(config.database.host, "db.internal");
            assert_eq!(config.database.port, 5433);
            assert_eq!(config.database.password, "secret");
            assert_eq!(config.pool.pool_size, 5);
            assert_eq!(config.pool.usage_limit, 100);
            assert!(config.pool.retire_exhausted);
            assert_eq!(config.pool.connection_delay_secs, 1.5);
            assert_eq!(config.pool.retry.max_attempts, 2);
            assert_eq!(config.pool.retry.backoff, RetryBackoff::Linear);
            assert_eq!(config.server.port, 8080);
            // Untouched sections keep their defaults
            assert_eq!(config.server.host, "0.0.0.0");
            assert_eq!(config.logging.format, "pretty");

            Ok(())
        })
    }

    #[test]
    fn test_load_from_environment_variables() -> Result<()> {
        with_isolated_env(|| -> Result<()> {
            let temp_dir = TempDir::new()?;

            unsafe {
                env::set_var("DBAL_POOL_POOL__POOL_SIZE", "3");
                env::set_var("DBAL_POOL_POOL__USE_POOLING", "false");
                env::set_var("DBAL_POOL_POOL__RETRY__MAX_ATTEMPTS", "4");
                env::set_var("DATABASE_URL", "postgres://env@localhost/envdb");
            }

            let config = Config::load_from_dir(temp_dir.path())?;

            assert_eq!(config.pool.pool_size, 3);
            assert!(!config.pool.use_pooling);
            assert_eq!(config.pool.retry.max_attempts, 4);
            assert_eq!(
                config.database.url.as_deref(),
                Some("postgres://env@localhost/envdb")
            );

            Ok(())
        })
    }

    #[test]
    fn test_precedence_env_over_file() -> Result<()> {
        with_isolated_env(|| -> Result<()> {
            let temp_dir = TempDir::new()?;
            let config_content = r#"
[database]
host = "filehost"
user = "fileuser"
"#;
            write(temp_dir.path().join("config.toml"), config_content)?;

            unsafe {
                env::set_var("DBAL_POOL_DATABASE__USER", "envuser");
            }

            let config = Config::load_from_dir(temp_dir.path())?;

            assert_eq!(config.database.user, "envuser");
            assert_eq!(config.database.host, "filehost");

            Ok(())
        })
    }

    #[test]
    fn test_load_rejects_invalid_file() -> Result<()> {
        with_isolated_env(|| -> Result<()> {
            let temp_dir = TempDir::new()?;
            write(temp_dir.path().join("config.toml"), "[pool]\npool_size = 0\n")?;

            assert!(Config::load_from_dir(temp_dir.path()).is_err());
            Ok(())
        })
    }

    #[test]
    fn test_load_no_config_file() -> Result<()> {
        with_isolated_env(|| -> Result<()> {
            let temp_dir = TempDir::new()?;

            let config = Config::load_from_dir(temp_dir.path())?;

            assert_eq!(config, Config::default());
            Ok(())
        })
    }
}
