//! Connection factory seam and its PostgreSQL implementation
//!
//! The pool never opens sockets itself. Everything that knows how to talk to
//! a database lives behind [`ConnectionFactory`], so the pooling logic can be
//! exercised against in-memory connections in tests.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, warn};

/// Opens and pings raw connections on behalf of the pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open one new connection
    async fn connect(&self) -> Result<Self::Connection, Self::Error>;

    /// Run the cheapest possible health query and report how many rows it
    /// produced. A live connection answers with exactly one row.
    async fn ping(&self, conn: &mut Self::Connection) -> Result<u64, Self::Error>;
}

/// Errors that can occur while opening PostgreSQL connections
#[derive(Error, Debug)]
pub enum ConnectionManagerError {
    #[error("Failed to connect: {0}")]
    ConnectionCreation(#[from] tokio_postgres::Error),

    #[error("Connection is closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Connection parameters for PostgreSQL
#[derive(Debug, Clone, PartialEq)]
pub struct PgConnectionConfig {
    /// Full connection URL; takes precedence over the discrete fields
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub connect_timeout_secs: u64,
}

impl Default for PgConnectionConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "127.0.0.1".to_string(),
            port: 5432,
            dbname: "postgres".to_string(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl PgConnectionConfig {
    /// Configuration pointing at a connection URL
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Set connection timeout in seconds
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.connect_timeout_secs = timeout_secs;
        self
    }

    /// Connection string in `key=value` form, or the URL when one is set
    pub fn dsn(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        [
            format!("host={}", quote_value(&self.host)),
            format!("port={}", self.port),
            format!("dbname={}", quote_value(&self.dbname)),
            format!("user={}", quote_value(&self.user)),
            format!("password={}", quote_value(&self.password)),
        ]
        .join(" ")
    }

    /// Build the driver configuration from [`dsn`](Self::dsn)
    fn to_pg_config(&self) -> Result<tokio_postgres::Config, ConnectionManagerError> {
        let mut config = self
            .dsn()
            .parse::<tokio_postgres::Config>()
            .map_err(|e| ConnectionManagerError::Configuration(e.to_string()))?;

        if self.connect_timeout_secs > 0 {
            config.connect_timeout(Duration::from_secs(self.connect_timeout_secs));
        }
        Ok(config)
    }

    fn target(&self) -> String {
        match &self.url {
            Some(_) => "<url>".to_string(),
            None => format!("{}:{}/{}", self.host, self.port, self.dbname),
        }
    }
}

/// Single-quote a `key=value` value when it would not survive unquoted
fn quote_value(value: &str) -> String {
    let plain = !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if plain {
        return value.to_string();
    }
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Opens `tokio-postgres` clients for the pool
#[derive(Debug, Clone)]
pub struct PgConnectionFactory {
    config: PgConnectionConfig,
}

impl PgConnectionFactory {
    pub fn new(config: PgConnectionConfig) -> Self {
        debug!("Creating PostgreSQL connection factory for {}", config.target());
        Self { config }
    }

    pub fn config(&self) -> &PgConnectionConfig {
        &self.config
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    type Connection = Client;
    type Error = ConnectionManagerError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        debug!("Opening new PostgreSQL connection");

        let pg_config = self.config.to_pg_config()?;
        let (client, connection) = pg_config.connect(NoTls).await.map_err(|e| {
            error!("Failed to open PostgreSQL connection: {}", e);
            ConnectionManagerError::ConnectionCreation(e)
        })?;

        // The protocol driver lives as long as the client; dropping the
        // client ends it.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "PostgreSQL connection terminated");
            }
        });

        debug!("PostgreSQL connection established");
        Ok(client)
    }

    async fn ping(&self, conn: &mut Self::Connection) -> Result<u64, Self::Error> {
        if conn.is_closed() {
            return Err(ConnectionManagerError::Closed);
        }
        Ok(conn.execute("SELECT 1", &[]).await?)
    }
}

impl fmt::Display for PgConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PgConnectionFactory(target={})", self.config.target())
    }
}
