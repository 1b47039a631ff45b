//! Automation execution audit log.

use crate::client::{storage_err, ClickHouseClient};
use crate::schema::EXECUTIONS_TABLE;
use async_trait::async_trait;
use clickhouse::Row;
use engine_core::{AutomationExecution, ExecutionScope, ExecutionStatus, ExecutionStore, Result};
use serde::{Deserialize, Serialize};

/// Row versions; the highest survives a merge.
const VERSION_RUNNING: u64 = 1;
const VERSION_FINAL: u64 = 2;

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct ExecutionRow {
    pub id: String,
    pub automation_id: String,
    pub website_id: String,
    pub visitor_id: Option<String>,
    pub session_id: Option<String>,
    pub status: String,
    pub trigger_payload: String,
    pub error_message: Option<String>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub version: u64,
}

impl ExecutionRow {
    fn new(execution: &AutomationExecution, version: u64) -> Self {
        Self {
            id: execution.id.to_string(),
            automation_id: execution.automation_id.clone(),
            website_id: execution.website_id.clone(),
            visitor_id: execution.visitor_id.clone(),
            session_id: execution.session_id.clone(),
            status: execution.status.as_str().to_string(),
            trigger_payload: execution.trigger_payload.to_string(),
            error_message: execution.error_message.clone(),
            started_at: execution.started_at.timestamp_millis(),
            completed_at: execution.completed_at.map(|t| t.timestamp_millis()),
            version,
        }
    }
}

/// ClickHouse-backed `ExecutionStore`.
#[derive(Clone)]
pub struct ClickHouseExecutionStore {
    client: ClickHouseClient,
}

impl ClickHouseExecutionStore {
    pub fn new(client: ClickHouseClient) -> Self {
        Self { client }
    }

    async fn insert(&self, row: ExecutionRow) -> Result<()> {
        let mut insert = self
            .client
            .inner()
            .insert(EXECUTIONS_TABLE)
            .map_err(storage_err("insert execution"))?;
        insert.write(&row).await.map_err(storage_err("write execution"))?;
        insert.end().await.map_err(storage_err("end execution insert"))
    }
}

#[async_trait]
impl ExecutionStore for ClickHouseExecutionStore {
    async fn start_execution(&self, execution: &AutomationExecution) -> Result<()> {
        self.insert(ExecutionRow::new(execution, VERSION_RUNNING)).await
    }

    async fn finish_execution(&self, execution: &AutomationExecution) -> Result<()> {
        self.insert(ExecutionRow::new(execution, VERSION_FINAL)).await
    }

    async fn has_successful_execution(
        &self,
        automation_id: &str,
        scope: &ExecutionScope,
    ) -> Result<bool> {
        let success = ExecutionStatus::Success.as_str();
        let base = "SELECT count() FROM automation_executions FINAL \
                    WHERE automation_id = ? AND status = ?";

        let query = match scope {
            ExecutionScope::Session(session_id) => self
                .client
                .inner()
                .query(&format!("{} AND session_id = ?", base))
                .bind(automation_id)
                .bind(success)
                .bind(session_id.as_str()),
            ExecutionScope::Visitor(visitor_id) => self
                .client
                .inner()
                .query(&format!("{} AND visitor_id = ?", base))
                .bind(automation_id)
                .bind(success)
                .bind(visitor_id.as_str()),
            ExecutionScope::VisitorSince(visitor_id, since) => self
                .client
                .inner()
                .query(&format!(
                    "{} AND visitor_id = ? AND started_at >= fromUnixTimestamp64Milli(?)",
                    base
                ))
                .bind(automation_id)
                .bind(success)
                .bind(visitor_id.as_str())
                .bind(since.timestamp_millis()),
        };

        let count: u64 = query
            .fetch_one()
            .await
            .map_err(storage_err("execution lookup"))?;
        Ok(count > 0)
    }
}
