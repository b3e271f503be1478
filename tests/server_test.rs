//! Tests for the HTTP demo endpoints

use axum::http::StatusCode;
use axum_test::TestServer;
use dbal_pool::db::{AcquireSettings, ConnectionPool, Connector, PoolSettings};
use dbal_pool::server::create_router;
use dbal_pool::test_helpers::MockFactory;
use serde_json::Value;
use std::time::Duration;

/// Helper function to create a test server backed by the mock factory
fn create_test_server(pool_size: usize) -> (TestServer, Connector<MockFactory>, MockFactory) {
    let factory = MockFactory::new();
    let pool = ConnectionPool::new(factory.clone(), PoolSettings::new(pool_size)).unwrap();
    let settings = AcquireSettings {
        connection_delay: Duration::from_millis(20),
        ..AcquireSettings::default()
    };
    let connector = Connector::new(pool, settings);
    let server = TestServer::new(create_router(connector.clone())).unwrap();
    (server, connector, factory)
}

#[tokio::test]
async fn test_health_endpoint_returns_200_ok() {
    let (server, _, _) = create_test_server(2);

    let response = server.get("/health").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "OK");
}

#[tokio::test]
async fn test_version_uses_and_returns_a_pooled_connection() {
    let (server, connector, factory) = create_test_server(2);

    let response = server.get("/version").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let json: Value = response.json();
    assert_eq!(json["success"], true);
    assert_eq!(json["version"], "MockDB 1.0 (connection 1)");
    assert_eq!(json["connection"], 1);
    assert_eq!(connector.pool().length(), 1);

    // Second request reuses the idle connection
    let json: Value = server.get("/version").await.json();
    assert_eq!(json["connection"], 1);
    assert_eq!(factory.connects(), 1);
}

#[tokio::test]
async fn test_status_reports_pool_usage() {
    let (server, connector, _) = create_test_server(4);
    let _held = connector.acquire().await.unwrap();

    let response = server.get("/status").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let json: Value = response.json();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["pool"]["max_size"], 4);
    assert_eq!(json["pool"]["in_use"], 1);
    assert_eq!(json["utilization_percent"], 25.0);
    assert!(json["checked_at"].is_string());
}

#[tokio::test]
async fn test_exhausted_pool_returns_503() {
    let (server, connector, _) = create_test_server(1);
    let _held = connector.acquire().await.unwrap();

    let response = server.get("/version").await;
    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);

    let json: Value = response.json();
    assert_eq!(json["success"], false);
    assert!(json["error"].as_str().unwrap().contains("No connection available"));
}

#[tokio::test]
async fn test_closed_pool_is_unhealthy() {
    let (server, connector, _) = create_test_server(2);
    connector.close();

    let response = server.get("/status").await;
    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    let json: Value = response.json();
    assert_eq!(json["status"], "unhealthy");

    let response = server.get("/version").await;
    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
}
