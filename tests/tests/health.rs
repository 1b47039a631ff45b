//! Tests for health check endpoints.
//!
//! The health registry is process-global, so tests that depend on its
//! state run one at a time.

use axum::http::StatusCode;
use integration_tests::setup::{mark_dependencies_healthy, TestContext};
use std::sync::{Mutex, MutexGuard};
use telemetry::health;

static HEALTH_STATE: Mutex<()> = Mutex::new(());

fn exclusive() -> MutexGuard<'static, ()> {
    HEALTH_STATE.lock().unwrap_or_else(|e| e.into_inner())
}

/// Test /health endpoint returns proper structure
#[tokio::test]
async fn test_health_endpoint_structure() {
    let _guard = exclusive();
    let mut ctx = TestContext::new();
    let server = ctx.server();

    let response = server.get("/health").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["intake_open"], true);
    assert!(body["collector_queue_depth"].is_u64());
    assert!(body["usage_queue_depth"].is_u64());
    assert!(body["automations_in_flight"].is_u64());

    let names: Vec<&str> = body["components"]
        .as_array()
        .expect("components should be an array")
        .iter()
        .filter_map(|c| c["name"].as_str())
        .collect();
    assert_eq!(names, vec!["redpanda", "clickhouse", "platform"]);

    ctx.shutdown().await;
}

/// A storage outage degrades health but keeps the service ready: the
/// broker absorbs the backlog.
#[tokio::test]
async fn test_storage_outage_is_degraded_but_ready() {
    let _guard = exclusive();
    let mut ctx = TestContext::new();
    let server = ctx.server();

    health().clickhouse.set_unhealthy("Connection refused");

    let body: serde_json::Value = server.get("/health").await.json();
    assert_eq!(body["status"], "degraded");
    let clickhouse = body["components"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["name"] == "clickhouse")
        .cloned()
        .unwrap();
    assert_eq!(clickhouse["healthy"], false);
    assert_eq!(clickhouse["message"], "Connection refused");

    server.get("/health/ready").await.assert_status_ok();

    mark_dependencies_healthy();
    ctx.shutdown().await;
}

/// Readiness needs the broker, the platform and open intake.
///
/// The running consumer keeps re-marking the broker healthy, so the
/// platform stands in for a failed dependency here.
#[tokio::test]
async fn test_readiness() {
    let _guard = exclusive();
    let mut ctx = TestContext::new();
    let server = ctx.server();

    server.get("/health/ready").await.assert_status_ok();

    health().platform.set_unhealthy("Connection failed");
    server
        .get("/health/ready")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);

    mark_dependencies_healthy();
    server.get("/health/ready").await.assert_status_ok();

    ctx.shutdown().await;
    server
        .get("/health/ready")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);

    let body: serde_json::Value = server.get("/health").await.json();
    assert_eq!(body["intake_open"], false);
}

/// Liveness does not depend on collaborators.
#[tokio::test]
async fn test_liveness() {
    let _guard = exclusive();
    let mut ctx = TestContext::new();
    let server = ctx.server();

    health().platform.set_unhealthy("Connection failed");
    server.get("/health/live").await.assert_status_ok();

    mark_dependencies_healthy();
    ctx.shutdown().await;
}
