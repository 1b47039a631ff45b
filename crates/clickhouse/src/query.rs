//! Query functions for reading data back (used in tests and admin).

use crate::client::{storage_err, ClickHouseClient};
use crate::events::EventRow;
use crate::executions::ExecutionRow;
use engine_core::{PartitionKey, Result};

/// Count events stored in one monthly partition.
pub async fn count_events(client: &ClickHouseClient, key: PartitionKey) -> Result<u64> {
    client
        .inner()
        .query(&format!("SELECT count() FROM {}", key.table_name()))
        .fetch_one()
        .await
        .map_err(storage_err("count events"))
}

/// Fetch a website's events from one partition, newest first.
pub async fn query_events(
    client: &ClickHouseClient,
    key: PartitionKey,
    website_id: &str,
    limit: u32,
) -> Result<Vec<EventRow>> {
    client
        .inner()
        .query(&format!(
            "SELECT ?fields FROM {} WHERE website_id = ? ORDER BY timestamp DESC LIMIT ?",
            key.table_name()
        ))
        .bind(website_id)
        .bind(limit)
        .fetch_all()
        .await
        .map_err(storage_err("query events"))
}

/// Final state of every execution of an automation.
pub async fn query_executions(
    client: &ClickHouseClient,
    automation_id: &str,
) -> Result<Vec<ExecutionRow>> {
    client
        .inner()
        .query(
            "SELECT ?fields FROM automation_executions FINAL \
             WHERE automation_id = ? ORDER BY started_at",
        )
        .bind(automation_id)
        .fetch_all()
        .await
        .map_err(storage_err("query executions"))
}

/// Drop one monthly partition (test cleanup).
pub async fn drop_partition(client: &ClickHouseClient, key: PartitionKey) -> Result<()> {
    client
        .inner()
        .query(&format!("DROP TABLE IF EXISTS {}", key.table_name()))
        .execute()
        .await
        .map_err(storage_err("drop partition"))
}
