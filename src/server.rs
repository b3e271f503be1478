//! HTTP front-end demonstrating per-request connection scopes
//!
//! Every request that touches the database opens its own
//! [`TaskScope`](crate::db::TaskScope), so
//! the connection goes back to the pool as soon as the handler returns or
//! fails.

use crate::db::{ConnectionFactory, ConnectionId, Connector, PoolError};
use crate::error::{BoxError, DbalError, Result};
use crate::health::{HealthStatus, PoolHealth};
use async_trait::async_trait;
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Connections that can report the server they are talking to
#[async_trait]
pub trait ServerVersion {
    async fn server_version(&mut self) -> std::result::Result<String, BoxError>;
}

#[async_trait]
impl ServerVersion for tokio_postgres::Client {
    async fn server_version(&mut self) -> std::result::Result<String, BoxError> {
        let row = self.query_one("SELECT version()", &[]).await?;
        Ok(row.try_get(0)?)
    }
}

#[cfg(any(test, feature = "test-helpers"))]
#[async_trait]
impl ServerVersion for crate::test_helpers::MockConnection {
    async fn server_version(&mut self) -> std::result::Result<String, BoxError> {
        self.query("SELECT version()");
        Ok(format!("MockDB 1.0 (connection {})", self.id))
    }
}

pub struct ServerState<F: ConnectionFactory> {
    pub connector: Connector<F>,
}

impl<F: ConnectionFactory> Clone for ServerState<F> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub connection: Option<ConnectionId>,
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub success: bool,
}

/// Maps crate errors onto HTTP responses
#[derive(Debug)]
pub struct ApiError(DbalError);

impl<E> From<E> for ApiError
where
    E: Into<DbalError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DbalError::Pool(PoolError::PoolClosed) => StatusCode::SERVICE_UNAVAILABLE,
            err if err.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
        }

        let body = ErrorResponse {
            error: self.0.to_string(),
            success: false,
        };
        (status, Json(body)).into_response()
    }
}

pub fn create_router<F>(connector: Connector<F>) -> Router
where
    F: ConnectionFactory,
    F::Connection: ServerVersion,
{
    let state = ServerState { connector };

    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(handle_status::<F>))
        .route("/version", get(handle_version::<F>))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn start_server<F, S>(connector: Connector<F>, addr: &str, shutdown: S) -> Result<()>
where
    F: ConnectionFactory,
    F::Connection: ServerVersion,
    S: Future<Output = ()> + Send + 'static,
{
    let app = create_router(connector);
    let listener = TcpListener::bind(addr).await?;

    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn handle_status<F: ConnectionFactory>(
    State(state): State<ServerState<F>>,
) -> (StatusCode, Json<PoolHealth>) {
    let health = PoolHealth::from_stats(state.connector.pool().stats());
    let code = match health.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(health))
}

async fn handle_version<F>(
    State(state): State<ServerState<F>>,
) -> std::result::Result<Json<VersionResponse>, ApiError>
where
    F: ConnectionFactory,
    F::Connection: ServerVersion,
{
    let mut scope = state.connector.scope();
    let version = scope
        .execute(|conn| Box::pin(async move { conn.server_version().await }))
        .await?
        .map_err(|e| DbalError::Database(e.to_string()))?;

    Ok(Json(VersionResponse {
        version,
        connection: scope.connection_id(),
        success: true,
    }))
}
