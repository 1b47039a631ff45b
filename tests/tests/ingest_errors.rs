//! Tests for ingestion rejections and failure paths.
//!
//! A rejected request must leave no trace: nothing published, no usage.

use axum::http::StatusCode;
use integration_tests::{fixtures, setup::TestContext};
use serde_json::json;

fn assert_error(response: &axum_test::TestResponse, status: StatusCode, code: &str) {
    response.assert_status(status);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], code, "unexpected error body: {}", body);
    assert!(body["error"].is_string());
}

/// Quota exceeded: rejection, zero broker publishes, zero usage increments.
#[tokio::test]
async fn test_quota_exceeded_has_no_side_effects() {
    let mut ctx = TestContext::new();
    ctx.platform.set_entitled(false);
    let server = ctx.server();

    let response = server
        .post("/api/events")
        .add_header("Origin", fixtures::ORIGIN)
        .json(&fixtures::pageview(fixtures::PUBLIC_SITE_ID))
        .await;

    assert_error(&response, StatusCode::TOO_MANY_REQUESTS, "QUOTA_001");
    assert_eq!(ctx.broker.publish_count(), 0);

    ctx.shutdown().await;
    assert!(ctx.platform.usage().is_empty());
    assert_eq!(ctx.store.row_count(), 0);
}

#[tokio::test]
async fn test_unavailable_entitlement_rejects() {
    let mut ctx = TestContext::new();
    ctx.platform.set_entitlement_unavailable(true);
    let server = ctx.server();

    let response = server
        .post("/api/events")
        .json(&fixtures::pageview(fixtures::PUBLIC_SITE_ID))
        .await;

    assert_error(&response, StatusCode::SERVICE_UNAVAILABLE, "QUOTA_002");
    assert_eq!(ctx.broker.publish_count(), 0);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_unknown_website() {
    let mut ctx = TestContext::new();
    let server = ctx.server();

    let response = server
        .post("/api/events")
        .json(&fixtures::pageview("pub_unknown"))
        .await;

    assert_error(&response, StatusCode::NOT_FOUND, "SITE_001");
    assert_eq!(ctx.broker.publish_count(), 0);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_inactive_website() {
    let mut ctx = TestContext::new();
    ctx.platform
        .add_website("pub_paused", fixtures::inactive_website());
    let server = ctx.server();

    let response = server
        .post("/api/events")
        .add_header("Origin", fixtures::ORIGIN)
        .json(&fixtures::pageview("pub_paused"))
        .await;

    assert_error(&response, StatusCode::FORBIDDEN, "SITE_002");
    assert_eq!(ctx.broker.publish_count(), 0);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_origin_mismatch() {
    let mut ctx = TestContext::new();
    let server = ctx.server();

    let response = server
        .post("/api/events")
        .add_header("Origin", "https://example.com.evil.test")
        .json(&fixtures::pageview(fixtures::PUBLIC_SITE_ID))
        .await;

    assert_error(&response, StatusCode::FORBIDDEN, "ORIGIN_001");

    // Same for a batch, where the header is checked once
    let response = server
        .post("/api/events/batch")
        .add_header("Origin", "https://evil.test")
        .json(&fixtures::batch(
            fixtures::PUBLIC_SITE_ID,
            fixtures::pageviews(2),
        ))
        .await;

    assert_error(&response, StatusCode::FORBIDDEN, "ORIGIN_001");
    assert_eq!(ctx.broker.publish_count(), 0);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_batch_origin_falls_back_to_first_referrer() {
    let mut ctx = TestContext::new();
    let server = ctx.server();

    let mut events = fixtures::pageviews(2);
    events[0]["referrer"] = json!("https://phishing.test/page");

    let response = server
        .post("/api/events/batch")
        .json(&fixtures::batch(fixtures::PUBLIC_SITE_ID, events))
        .await;

    assert_error(&response, StatusCode::FORBIDDEN, "ORIGIN_001");
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_malformed_json() {
    let mut ctx = TestContext::new();
    let server = ctx.server();

    let response = server
        .post("/api/events")
        .content_type("application/json")
        .bytes("{not json".into())
        .await;

    assert_error(&response, StatusCode::BAD_REQUEST, "VALID_001");
    ctx.shutdown().await;
}

/// Client timestamps far from receipt time would each open a new monthly
/// partition; they are refused before publishing.
#[tokio::test]
async fn test_out_of_window_timestamp_is_rejected() {
    let mut ctx = TestContext::new();
    let server = ctx.server();

    for timestamp in ["1000-01-01T00:00:00Z", "8363-08-01T00:00:00Z"] {
        let mut event = fixtures::pageview(fixtures::PUBLIC_SITE_ID);
        event["timestamp"] = json!(timestamp);
        let response = server
            .post("/api/events")
            .add_header("Origin", fixtures::ORIGIN)
            .json(&event)
            .await;
        assert_error(&response, StatusCode::BAD_REQUEST, "VALID_001");
    }

    // In a batch only the stale event is skipped
    let mut stale = fixtures::pageview(fixtures::PUBLIC_SITE_ID);
    stale["timestamp"] = json!("1999-12-31T23:59:59Z");
    let response = server
        .post("/api/events/batch")
        .add_header("Origin", fixtures::ORIGIN)
        .json(&fixtures::batch(
            fixtures::PUBLIC_SITE_ID,
            vec![stale, fixtures::pageview(fixtures::PUBLIC_SITE_ID)],
        ))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["eventsCount"], 1);

    assert_eq!(ctx.broker.publish_count(), 1);
    ctx.shutdown().await;
    assert_eq!(ctx.store.created_partitions().len(), 1);
}

#[tokio::test]
async fn test_missing_site_id() {
    let mut ctx = TestContext::new();
    let server = ctx.server();

    let response = server
        .post("/api/events")
        .json(&json!({"path": "/"}))
        .await;

    assert_error(&response, StatusCode::BAD_REQUEST, "VALID_001");
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_oversized_properties() {
    let mut ctx = TestContext::new();
    let server = ctx.server();

    let mut event = fixtures::pageview(fixtures::PUBLIC_SITE_ID);
    event["properties"] = fixtures::oversized_properties();

    let response = server
        .post("/api/events")
        .add_header("Origin", fixtures::ORIGIN)
        .json(&event)
        .await;

    assert_error(&response, StatusCode::PAYLOAD_TOO_LARGE, "VALID_003");
    assert_eq!(ctx.broker.publish_count(), 0);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_batch_limits() {
    let mut ctx = TestContext::new();
    let server = ctx.server();

    // Too many events
    let response = server
        .post("/api/events/batch")
        .json(&fixtures::batch(
            fixtures::PUBLIC_SITE_ID,
            fixtures::pageviews(1001),
        ))
        .await;
    assert_error(&response, StatusCode::PAYLOAD_TOO_LARGE, "VALID_002");

    // Too many bytes
    let mut events = fixtures::pageviews(100);
    for event in &mut events {
        event["properties"] = json!({ "blob": "x".repeat(12 * 1024) });
    }
    let response = server
        .post("/api/events/batch")
        .json(&fixtures::batch(fixtures::PUBLIC_SITE_ID, events))
        .await;
    assert_error(&response, StatusCode::PAYLOAD_TOO_LARGE, "VALID_002");

    // Nothing at all
    let response = server
        .post("/api/events/batch")
        .json(&fixtures::batch(fixtures::PUBLIC_SITE_ID, vec![]))
        .await;
    assert_error(&response, StatusCode::BAD_REQUEST, "VALID_001");

    assert_eq!(ctx.broker.publish_count(), 0);
    ctx.shutdown().await;
}

/// Broker failure is a synchronous ingestion failure with no usage.
#[tokio::test]
async fn test_broker_failure_fails_the_request() {
    let mut ctx = TestContext::new();
    ctx.broker.set_should_fail(true);
    let server = ctx.server();

    let response = server
        .post("/api/events")
        .add_header("Origin", fixtures::ORIGIN)
        .json(&fixtures::pageview(fixtures::PUBLIC_SITE_ID))
        .await;

    assert_error(&response, StatusCode::BAD_GATEWAY, "BROKER_001");

    ctx.shutdown().await;
    assert!(ctx.platform.usage().is_empty());
}

/// A saturated usage queue never blocks or fails a valid event.
#[tokio::test]
async fn test_full_usage_queue_does_not_fail_ingestion() {
    let mut ctx = TestContext::with_stalled_usage(1);
    let server = ctx.server();

    for _ in 0..5 {
        server
            .post("/api/events")
            .add_header("Origin", fixtures::ORIGIN)
            .json(&fixtures::pageview(fixtures::PUBLIC_SITE_ID))
            .await
            .assert_status_ok();
    }

    assert_eq!(ctx.broker.publish_count(), 5);
    ctx.shutdown().await;
    assert_eq!(ctx.store.row_count(), 5);
}

#[tokio::test]
async fn test_closed_gateway_refuses_events() {
    let mut ctx = TestContext::new();
    let server = ctx.server();
    ctx.shutdown().await;

    let response = server
        .post("/api/events")
        .add_header("Origin", fixtures::ORIGIN)
        .json(&fixtures::pageview(fixtures::PUBLIC_SITE_ID))
        .await;
    assert_error(&response, StatusCode::SERVICE_UNAVAILABLE, "SHUTDOWN_001");

    let response = server
        .post("/api/events/batch")
        .json(&fixtures::batch(
            fixtures::PUBLIC_SITE_ID,
            fixtures::pageviews(1),
        ))
        .await;
    assert_error(&response, StatusCode::SERVICE_UNAVAILABLE, "SHUTDOWN_001");
    assert_eq!(ctx.broker.publish_count(), 0);
}
