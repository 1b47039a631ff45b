//! Seams to the collaborators and stores the pipeline talks to.
//!
//! Production implementations live in the `api` (platform HTTP client) and
//! `clickhouse-client` crates; tests plug in in-memory versions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::automation::{Automation, AutomationExecution, ExecutionScope};
use crate::error::Result;
use crate::events::TrackedEvent;
use crate::partition::PartitionKey;
use crate::website::{origin_matches, Website};

/// Resolves public website ids to their canonical record.
#[async_trait]
pub trait WebsiteDirectory: Send + Sync {
    /// Fails on an unknown id.
    async fn resolve_website(&self, public_id: &str) -> Result<Website>;

    fn validate_origin(&self, origin: Option<&str>, registered_domain: &str) -> bool {
        origin_matches(origin, registered_domain)
    }
}

/// Metered resource kinds reported to billing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Events,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Events => "events",
        }
    }
}

/// Opaque entitlement and usage metering.
#[async_trait]
pub trait BillingService: Send + Sync {
    async fn can_record_event(&self, tenant_id: &str) -> Result<bool>;

    async fn increment_usage(&self, tenant_id: &str, kind: ResourceKind, count: u64) -> Result<()>;
}

/// Read-only source of automation rules.
#[async_trait]
pub trait AutomationSource: Send + Sync {
    async fn list_active_automations(&self, website_id: &str) -> Result<Vec<Automation>>;
}

/// Result of one batch write.
///
/// Stores write each month partition separately, so failures are reported
/// per partition; rows of any other partition in the batch were stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub processed: usize,
    pub failed: usize,
    pub total: usize,
    #[serde(default)]
    pub failed_partitions: BTreeSet<PartitionKey>,
}

impl WriteOutcome {
    /// `count` rows stored.
    pub fn stored(count: usize) -> Self {
        Self {
            processed: count,
            failed: 0,
            total: count,
            failed_partitions: BTreeSet::new(),
        }
    }

    /// `count` rows of partition `key` not stored.
    pub fn rejected(key: PartitionKey, count: usize) -> Self {
        Self {
            processed: 0,
            failed: count,
            total: count,
            failed_partitions: BTreeSet::from([key]),
        }
    }

    pub fn merge(&mut self, other: WriteOutcome) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.total += other.total;
        self.failed_partitions.extend(other.failed_partitions);
    }

    /// Whether rows of `key` made it to storage.
    pub fn is_stored(&self, key: PartitionKey) -> bool {
        !self.failed_partitions.contains(&key)
    }
}

/// Month-partitioned event storage.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn partition_exists(&self, key: PartitionKey) -> Result<bool>;

    /// Creates the partition bounded to `[key.start(), key.end())`.
    async fn create_partition(&self, key: PartitionKey) -> Result<()>;

    async fn write_batch(&self, events: &[TrackedEvent]) -> Result<WriteOutcome>;
}

/// Automation execution audit log.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Records a `running` execution.
    async fn start_execution(&self, execution: &AutomationExecution) -> Result<()>;

    /// Overwrites the execution with its final status.
    async fn finish_execution(&self, execution: &AutomationExecution) -> Result<()>;

    /// Whether a successful execution exists for the automation within `scope`.
    async fn has_successful_execution(
        &self,
        automation_id: &str,
        scope: &ExecutionScope,
    ) -> Result<bool>;
}
