//! Storage tests against a real ClickHouse.
//!
//! Requires Docker (or `PULSE_TEST_CLICKHOUSE_URL`), so they are ignored
//! by default: `cargo test -p integration-tests -- --ignored`.

use chrono::{TimeZone, Utc};
use clickhouse_client::{
    count_events, drop_partition, query_events, query_executions, ClickHouseEventStore,
    ClickHouseExecutionStore,
};
use engine_core::{
    AutomationExecution, EventInput, EventStore, ExecutionScope, ExecutionStore, PartitionKey,
    TrackedEvent, TriggerPayload,
};
use integration_tests::{containers::TestClickHouse, fixtures};
use serde_json::json;
use std::sync::Arc;
use worker::{flush_batch, PartitionProvisioner};

fn event_at(year: i32, month: u32, day: u32, visitor: &str) -> TrackedEvent {
    let ts = Utc.with_ymd_and_hms(year, month, day, 12, 30, 0).unwrap();
    let input = EventInput {
        visitor_id: Some(visitor.to_string()),
        session_id: Some(format!("{}-session", visitor)),
        page_path: "/docs".to_string(),
        timestamp: Some(ts),
        ..Default::default()
    };
    TrackedEvent::from_input(input, fixtures::CANONICAL_SITE_ID, ts)
}

/// A batch spanning two months lands in two bounded partitions.
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_flush_provisions_and_writes_monthly_partitions() {
    let clickhouse = TestClickHouse::start().await;
    let client = clickhouse.client().await;

    let dec = PartitionKey::new(2031, 12).unwrap();
    let jan = PartitionKey::new(2032, 1).unwrap();
    drop_partition(&client, dec).await.unwrap();
    drop_partition(&client, jan).await.unwrap();

    let store: Arc<dyn EventStore> = Arc::new(ClickHouseEventStore::new(client.clone()));
    let provisioner = PartitionProvisioner::new(store.clone(), None);

    let batch = vec![
        event_at(2031, 12, 31, "visitor-a"),
        event_at(2032, 1, 1, "visitor-b"),
        event_at(2032, 1, 2, "visitor-c"),
    ];
    let outcome = flush_batch(&store, &provisioner, &batch).await.unwrap();

    assert_eq!(outcome.processed, 3);
    assert_eq!(outcome.failed, 0);
    assert!(store.partition_exists(dec).await.unwrap());
    assert!(store.partition_exists(jan).await.unwrap());
    assert_eq!(count_events(&client, dec).await.unwrap(), 1);
    assert_eq!(count_events(&client, jan).await.unwrap(), 2);

    let rows = query_events(&client, jan, fixtures::CANONICAL_SITE_ID, 10)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].visitor_id, "visitor-c", "newest first");
    assert_eq!(rows[0].page_path, "/docs");

    drop_partition(&client, dec).await.unwrap();
    drop_partition(&client, jan).await.unwrap();
}

/// A partition rejects rows outside its month.
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_partition_rejects_out_of_range_rows() {
    let clickhouse = TestClickHouse::start().await;
    let client = clickhouse.client().await;

    let key = PartitionKey::new(2031, 6).unwrap();
    drop_partition(&client, key).await.unwrap();

    let store = ClickHouseEventStore::new(client.clone());
    store.create_partition(key).await.unwrap();
    // Creating twice is harmless
    store.create_partition(key).await.unwrap();

    let mut stray = event_at(2031, 7, 1, "visitor-a");
    // Force a July event into the June table by hand
    stray.timestamp = Utc.with_ymd_and_hms(2031, 7, 1, 0, 0, 0).unwrap();
    let rows = clickhouse_client::group_by_partition(&[stray]);
    let (_, rows) = rows.into_iter().next().unwrap();

    let mut insert = client.inner().insert(&key.table_name()).unwrap();
    for row in &rows {
        insert.write(row).await.unwrap();
    }
    assert!(insert.end().await.is_err(), "constraint should reject July in June");
    assert_eq!(count_events(&client, key).await.unwrap(), 0);

    drop_partition(&client, key).await.unwrap();
}

/// Running then final rows collapse to one record; frequency lookups see
/// only successes.
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_execution_records_and_frequency_lookup() {
    let clickhouse = TestClickHouse::start().await;
    let client = clickhouse.client().await;
    let store = ClickHouseExecutionStore::new(client.clone());

    let automation_id = format!("auto-{}", uuid::Uuid::new_v4());
    let automation = fixtures::automation(
        &automation_id,
        json!({"type": "pageview"}),
        json!([fixtures::email_action("ops@example.com")]),
        "once_per_visitor",
    );

    let event = event_at(2031, 3, 3, "visitor-x");
    let payload = TriggerPayload::from(&event);

    let mut failed = AutomationExecution::start(&automation, &payload);
    store.start_execution(&failed).await.unwrap();
    failed.fail("webhook returned 500");
    store.finish_execution(&failed).await.unwrap();

    let visitor = ExecutionScope::Visitor("visitor-x".into());
    assert!(!store
        .has_successful_execution(&automation_id, &visitor)
        .await
        .unwrap());

    let mut succeeded = AutomationExecution::start(&automation, &payload);
    store.start_execution(&succeeded).await.unwrap();
    succeeded.succeed();
    store.finish_execution(&succeeded).await.unwrap();

    assert!(store
        .has_successful_execution(&automation_id, &visitor)
        .await
        .unwrap());
    assert!(store
        .has_successful_execution(
            &automation_id,
            &ExecutionScope::Session("visitor-x-session".into())
        )
        .await
        .unwrap());
    assert!(!store
        .has_successful_execution(&automation_id, &ExecutionScope::Visitor("other".into()))
        .await
        .unwrap());
    let tomorrow = Utc::now() + chrono::Duration::days(1);
    assert!(!store
        .has_successful_execution(
            &automation_id,
            &ExecutionScope::VisitorSince("visitor-x".into(), tomorrow)
        )
        .await
        .unwrap());

    let rows = query_executions(&client, &automation_id).await.unwrap();
    assert_eq!(rows.len(), 2, "one record per run after FINAL");
    let statuses: Vec<_> = rows.iter().map(|r| r.status.as_str()).collect();
    assert!(statuses.contains(&"failed"));
    assert!(statuses.contains(&"success"));
}
