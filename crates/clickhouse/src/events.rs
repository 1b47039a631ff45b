//! Month-partitioned event storage.

use crate::client::{storage_err, ClickHouseClient};
use crate::schema::create_partition_sql;
use async_trait::async_trait;
use clickhouse::Row;
use engine_core::{EventStore, PartitionKey, Result, TrackedEvent, WriteOutcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, error};

/// Flattened event row for ClickHouse insertion.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct EventRow {
    pub id: String,
    pub website_id: String,
    pub visitor_id: String,
    pub session_id: String,
    pub event_type: String,
    pub event_name: Option<String>,
    pub page_path: String,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub browser: Option<String>,
    pub browser_version: Option<String>,
    pub os: Option<String>,
    pub device_type: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub continent: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// JSON-encoded properties
    pub properties: String,
    pub timestamp: i64, // milliseconds since epoch
    pub created_at: i64,
}

impl From<&TrackedEvent> for EventRow {
    fn from(event: &TrackedEvent) -> Self {
        Self {
            id: event.id.to_string(),
            website_id: event.website_id.clone(),
            visitor_id: event.visitor_id.clone(),
            session_id: event.session_id.clone(),
            event_type: event.event_type.clone(),
            event_name: event.event_name.clone(),
            page_path: event.page_path.clone(),
            referrer: event.referrer.clone(),
            user_agent: event.user_agent.clone(),
            ip: event.ip.clone(),
            browser: event.browser.clone(),
            browser_version: event.browser_version.clone(),
            os: event.os.clone(),
            device_type: event.device_type.clone(),
            country: event.country.clone(),
            city: event.city.clone(),
            continent: event.continent.clone(),
            latitude: event.latitude,
            longitude: event.longitude,
            properties: serde_json::to_string(&event.properties)
                .unwrap_or_else(|_| "{}".to_string()),
            timestamp: event.timestamp.timestamp_millis(),
            created_at: event.created_at.timestamp_millis(),
        }
    }
}

/// Groups events by the monthly partition they belong to.
pub fn group_by_partition(events: &[TrackedEvent]) -> BTreeMap<PartitionKey, Vec<EventRow>> {
    let mut groups: BTreeMap<PartitionKey, Vec<EventRow>> = BTreeMap::new();
    for event in events {
        groups
            .entry(event.partition_key())
            .or_default()
            .push(EventRow::from(event));
    }
    groups
}

/// ClickHouse-backed `EventStore`.
#[derive(Clone)]
pub struct ClickHouseEventStore {
    client: ClickHouseClient,
}

impl ClickHouseEventStore {
    pub fn new(client: ClickHouseClient) -> Self {
        Self { client }
    }

    async fn insert_rows(&self, table: &str, rows: &[EventRow]) -> Result<()> {
        let mut insert = self
            .client
            .inner()
            .insert(table)
            .map_err(storage_err("insert"))?;
        for row in rows {
            insert.write(row).await.map_err(storage_err("write"))?;
        }
        insert.end().await.map_err(storage_err("end insert"))?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for ClickHouseEventStore {
    async fn partition_exists(&self, key: PartitionKey) -> Result<bool> {
        let count: u64 = self
            .client
            .inner()
            .query("SELECT count() FROM system.tables WHERE database = ? AND name = ?")
            .bind(self.client.database())
            .bind(key.table_name())
            .fetch_one()
            .await
            .map_err(storage_err("partition lookup"))?;
        Ok(count > 0)
    }

    async fn create_partition(&self, key: PartitionKey) -> Result<()> {
        self.client
            .inner()
            .query(&create_partition_sql(key))
            .execute()
            .await
            .map_err(storage_err("create partition"))
    }

    /// Writes one insert per partition present in the batch.
    ///
    /// A failed partition counts its rows as failed; other partitions are
    /// still written.
    async fn write_batch(&self, events: &[TrackedEvent]) -> Result<WriteOutcome> {
        let mut outcome = WriteOutcome::default();

        for (key, rows) in group_by_partition(events) {
            let start = Instant::now();
            let table = key.table_name();
            let count = rows.len();

            match self.insert_rows(&table, &rows).await {
                Ok(()) => {
                    debug!(
                        table = %table,
                        count = count,
                        latency_ms = %start.elapsed().as_millis(),
                        "Inserted events"
                    );
                    outcome.merge(WriteOutcome::stored(count));
                }
                Err(e) => {
                    error!(table = %table, count = count, error = %e, "Failed to insert events");
                    outcome.merge(WriteOutcome::rejected(key, count));
                }
            }
        }

        Ok(outcome)
    }
}
