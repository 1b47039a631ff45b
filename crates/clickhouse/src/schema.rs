//! ClickHouse table schemas.
//!
//! Events live in one table per calendar month (`events_YYYY_MM`), each
//! carrying a CHECK constraint that pins rows to the month's range. The
//! execution audit log is a single `ReplacingMergeTree`, so the `running`
//! row and its final row share an id and collapse on merge.

use crate::client::{storage_err, ClickHouseClient};
use engine_core::{PartitionKey, Result};

/// Audit table for automation runs.
pub const EXECUTIONS_TABLE: &str = "automation_executions";

/// SQL for creating the execution audit table.
pub const CREATE_EXECUTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS automation_executions (
    id String,
    automation_id String,
    website_id String,
    visitor_id Nullable(String),
    session_id Nullable(String),
    status LowCardinality(String),
    trigger_payload String,
    error_message Nullable(String),
    started_at DateTime64(3, 'UTC'),
    completed_at Nullable(DateTime64(3, 'UTC')),
    version UInt64
)
ENGINE = ReplacingMergeTree(version)
ORDER BY (automation_id, id)
"#;

/// SQL for one monthly event partition.
///
/// Rows outside `[key.start(), key.end())` are rejected by the server.
pub fn create_partition_sql(key: PartitionKey) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    id String,
    website_id String,
    visitor_id String,
    session_id String,
    event_type LowCardinality(String),
    event_name Nullable(String),
    page_path String,
    referrer Nullable(String),
    user_agent Nullable(String),
    ip Nullable(String),
    browser LowCardinality(Nullable(String)),
    browser_version Nullable(String),
    os LowCardinality(Nullable(String)),
    device_type LowCardinality(Nullable(String)),
    country LowCardinality(Nullable(String)),
    city Nullable(String),
    continent LowCardinality(Nullable(String)),
    latitude Nullable(Float64),
    longitude Nullable(Float64),
    properties String,
    timestamp DateTime64(3, 'UTC'),
    created_at DateTime64(3, 'UTC'),
    CONSTRAINT timestamp_in_month CHECK
        timestamp >= toDateTime64('{start}', 3, 'UTC')
        AND timestamp < toDateTime64('{end}', 3, 'UTC')
)
ENGINE = MergeTree()
ORDER BY (website_id, timestamp, id)
SETTINGS index_granularity = 8192
"#,
        table = key.table_name(),
        start = key.start().format("%Y-%m-%d %H:%M:%S"),
        end = key.end().format("%Y-%m-%d %H:%M:%S"),
    )
}

/// Initialize the database schema.
///
/// Event partitions are created lazily by the provisioner, so only the
/// database and the audit table are set up here.
pub async fn init_schema(client: &ClickHouseClient, create_database: bool) -> Result<()> {
    if create_database {
        client.ensure_database().await?;
    }

    client
        .inner()
        .query(CREATE_EXECUTIONS_TABLE)
        .execute()
        .await
        .map_err(storage_err("schema init"))?;
    Ok(())
}
