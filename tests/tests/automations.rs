//! End-to-end tests for automations fired by ingested events.
//!
//! Events go through the whole pipeline; automations run only after the
//! collector accepted the event. Webhooks hit a wiremock server.

use chrono::Utc;
use engine_core::{AutomationExecution, EventInput, ExecutionStatus, TrackedEvent, TriggerPayload};
use integration_tests::{
    fixtures,
    setup::{eventually, TestContext},
};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SETTLE: Duration = Duration::from_secs(3);

/// Posts a `signup` custom event for `visitor`.
async fn post_signup(ctx: &TestContext, visitor: &str) {
    ctx.server()
        .post("/api/events")
        .add_header("Origin", fixtures::ORIGIN)
        .json(&fixtures::custom_event(
            fixtures::PUBLIC_SITE_ID,
            "signup",
            visitor,
        ))
        .await
        .assert_status_ok();
}

async fn wait_for_final_executions(ctx: &TestContext, automation_id: &str, count: usize) -> bool {
    eventually(SETTLE, || {
        ctx.executions
            .executions_for(automation_id)
            .iter()
            .filter(|e| e.status != ExecutionStatus::Running)
            .count()
            >= count
    })
    .await
}

#[tokio::test]
async fn test_webhook_then_email_succeeds() {
    let webhook = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/signup"))
        .and(header("X-Test", "1"))
        .and(body_partial_json(json!({
            "source": "pulse",
            "website_id": fixtures::CANONICAL_SITE_ID,
            "event_name": "signup",
            "visitor_id": "visitor-1"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&webhook)
        .await;

    let mut ctx = TestContext::new();
    ctx.platform.add_automation(fixtures::automation(
        "auto-signup",
        fixtures::event_trigger("signup"),
        json!([
            fixtures::webhook_action(&format!("{}/hooks/signup", webhook.uri())),
            fixtures::email_action("sales@example.com"),
        ]),
        "always",
    ));

    post_signup(&ctx, "visitor-1").await;

    assert!(wait_for_final_executions(&ctx, "auto-signup", 1).await);
    let executions = ctx.executions.executions_for("auto-signup");
    assert_eq!(executions.len(), 1, "one record per run");
    assert_eq!(executions[0].status, ExecutionStatus::Success);
    assert_eq!(executions[0].visitor_id.as_deref(), Some("visitor-1"));
    assert!(executions[0].completed_at.is_some());

    let sent = ctx.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.to, "sales@example.com");
    assert_eq!(sent[0].1.website_id, fixtures::CANONICAL_SITE_ID);

    ctx.shutdown().await;
}

/// `[webhook(fails), email]` yields one failed record and no email.
#[tokio::test]
async fn test_failed_webhook_short_circuits_email() {
    let webhook = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&webhook)
        .await;

    let mut ctx = TestContext::new();
    ctx.platform.add_automation(fixtures::automation(
        "auto-broken",
        fixtures::event_trigger("signup"),
        json!([
            fixtures::webhook_action(&webhook.uri()),
            fixtures::email_action("sales@example.com"),
        ]),
        "always",
    ));

    post_signup(&ctx, "visitor-1").await;

    assert!(wait_for_final_executions(&ctx, "auto-broken", 1).await);
    let executions = ctx.executions.executions_for("auto-broken");
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
    let error = executions[0].error_message.as_deref().unwrap_or_default();
    assert!(error.contains("webhook"), "error should name the action: {}", error);

    assert!(ctx.mailer.sent().is_empty(), "email must never be invoked");

    // Event persistence is unaffected by the automation failure
    assert!(ctx.wait_for_rows(1, SETTLE).await);
    ctx.shutdown().await;
}

/// A prior success for the visitor suppresses the run entirely.
#[tokio::test]
async fn test_once_per_visitor_skips_with_prior_success() {
    let mut ctx = TestContext::new();
    let automation = fixtures::automation(
        "auto-welcome",
        fixtures::event_trigger("signup"),
        json!([fixtures::email_action("welcome@example.com")]),
        "once_per_visitor",
    );
    ctx.platform.add_automation(automation.clone());

    let earlier = TrackedEvent::from_input(
        EventInput {
            visitor_id: Some("visitor-1".into()),
            ..Default::default()
        },
        fixtures::CANONICAL_SITE_ID,
        Utc::now(),
    );
    let mut prior = AutomationExecution::start(&automation, &TriggerPayload::from(&earlier));
    prior.succeed();
    ctx.executions.insert(prior);

    post_signup(&ctx, "visitor-1").await;
    post_signup(&ctx, "visitor-2").await;

    assert!(wait_for_final_executions(&ctx, "auto-welcome", 2).await);
    // Give a stray visitor-1 run time to show up
    tokio::time::sleep(Duration::from_millis(200)).await;

    let executions = ctx.executions.executions_for("auto-welcome");
    assert_eq!(executions.len(), 2, "seeded record plus visitor-2 only");
    let visitor_one = executions
        .iter()
        .filter(|e| e.visitor_id.as_deref() == Some("visitor-1"))
        .count();
    assert_eq!(visitor_one, 1, "no new record for visitor-1");

    let sent = ctx.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1.visitor_id, "visitor-2");

    ctx.shutdown().await;
}

/// Repeat matches after a success produce no new execution record.
#[tokio::test]
async fn test_once_per_visitor_repeat_match() {
    let mut ctx = TestContext::new();
    ctx.platform.add_automation(fixtures::automation(
        "auto-once",
        fixtures::event_trigger("signup"),
        json!([fixtures::email_action("welcome@example.com")]),
        "once_per_visitor",
    ));

    post_signup(&ctx, "visitor-1").await;
    assert!(wait_for_final_executions(&ctx, "auto-once", 1).await);

    post_signup(&ctx, "visitor-1").await;
    assert!(ctx.wait_for_rows(2, SETTLE).await);
    ctx.shutdown().await;

    assert_eq!(ctx.executions.executions_for("auto-once").len(), 1);
    assert_eq!(ctx.mailer.sent().len(), 1);
}

#[tokio::test]
async fn test_conditions_gate_without_record() {
    let mut ctx = TestContext::new();
    ctx.platform.add_automation(fixtures::automation_with_conditions(
        "auto-enterprise",
        fixtures::event_trigger("signup"),
        json!([{"type": "property", "config": {"key": "plan", "value": "enterprise"}}]),
        json!([fixtures::email_action("sales@example.com")]),
        "always",
    ));
    ctx.platform.add_automation(fixtures::automation_with_conditions(
        "auto-pro",
        fixtures::event_trigger("signup"),
        json!([
            {"type": "property", "config": {"key": "plan", "value": "PRO"}},
            {"type": "page_path", "config": {"operator": "starts_with", "value": "/sign"}}
        ]),
        json!([fixtures::email_action("pro@example.com")]),
        "always",
    ));

    post_signup(&ctx, "visitor-1").await;

    assert!(wait_for_final_executions(&ctx, "auto-pro", 1).await);
    ctx.shutdown().await;

    assert!(ctx.executions.executions_for("auto-enterprise").is_empty());
    let sent = ctx.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.to, "pro@example.com");
}

/// Unrecognized tags stay permissive: the trigger matches, the condition
/// passes and the action is a successful no-op.
#[tokio::test]
async fn test_unknown_types_are_permissive() {
    let mut ctx = TestContext::new();
    ctx.platform.add_automation(fixtures::automation_with_conditions(
        "auto-future",
        json!({"type": "scroll_depth", "config": {"percent": 75}}),
        json!([{"type": "weather", "config": {"value": "sunny"}}]),
        json!([
            {"type": "sms", "config": {"to": "+15550100"}},
            fixtures::email_action("ops@example.com")
        ]),
        "always",
    ));

    ctx.server()
        .post("/api/events")
        .add_header("Origin", fixtures::ORIGIN)
        .json(&fixtures::pageview(fixtures::PUBLIC_SITE_ID))
        .await
        .assert_status_ok();

    assert!(wait_for_final_executions(&ctx, "auto-future", 1).await);
    ctx.shutdown().await;

    let executions = ctx.executions.executions_for("auto-future");
    assert_eq!(executions[0].status, ExecutionStatus::Success);
    assert_eq!(ctx.mailer.sent().len(), 1);
}

/// Unreadable history skips the run instead of risking a duplicate.
#[tokio::test]
async fn test_history_failure_skips_gated_automation() {
    let mut ctx = TestContext::new();
    ctx.executions.set_fail_history(true);
    ctx.platform.add_automation(fixtures::automation(
        "auto-gated",
        fixtures::event_trigger("signup"),
        json!([fixtures::email_action("welcome@example.com")]),
        "once_per_session",
    ));

    post_signup(&ctx, "visitor-1").await;
    assert!(ctx.wait_for_rows(1, SETTLE).await);
    ctx.shutdown().await;

    assert!(ctx.executions.executions().is_empty());
    assert!(ctx.mailer.sent().is_empty());
}

/// Shutdown waits for automations that are still running.
#[tokio::test]
async fn test_shutdown_drains_in_flight_automations() {
    let webhook = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_millis(300)))
        .mount(&webhook)
        .await;

    let mut ctx = TestContext::new();
    ctx.platform.add_automation(fixtures::automation(
        "auto-slow",
        fixtures::event_trigger("signup"),
        json!([fixtures::webhook_action(&webhook.uri())]),
        "always",
    ));

    post_signup(&ctx, "visitor-1").await;
    assert!(
        eventually(SETTLE, || !ctx.executions.executions_for("auto-slow").is_empty()).await,
        "run should have started"
    );

    let report = ctx.shutdown().await;
    assert!(report.is_clean(), "{:?}", report);

    let executions = ctx.executions.executions_for("auto-slow");
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Success);
}
