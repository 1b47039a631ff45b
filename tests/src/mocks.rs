//! In-memory collaborators for end-to-end tests.
//!
//! Each mock implements the same trait as its production counterpart, so
//! the gateway, pipeline and automation engine run their real code paths
//! with only the network edges replaced.

use async_trait::async_trait;
use automation::Mailer;
use engine_core::{
    Automation, AutomationExecution, AutomationSource, BillingService, EmailAction, Error,
    EventStore, ExecutionScope, ExecutionStatus, ExecutionStore, PartitionKey, RejectionCode,
    ResourceKind, Result, TrackedEvent, TriggerPayload, Website, WebsiteDirectory, WriteOutcome,
};
use parking_lot::Mutex;
use redpanda::{DeadLetter, DeadLetterSink, Delivery, EventProducer, MessageSource};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Broker stand-in: what the gateway publishes is what the consumer fetches.
#[derive(Default)]
pub struct MemoryBroker {
    queue: Mutex<VecDeque<Delivery>>,
    published: Mutex<Vec<TrackedEvent>>,
    acked: Mutex<Vec<i64>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    next_offset: AtomicI64,
    should_fail: AtomicBool,
    closed: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event accepted by `publish`.
    pub fn published(&self) -> Vec<TrackedEvent> {
        self.published.lock().clone()
    }

    pub fn publish_count(&self) -> usize {
        self.published.lock().len()
    }

    pub fn acked(&self) -> Vec<i64> {
        self.acked.lock().clone()
    }

    /// Messages not yet fetched by the consumer.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulate a broker outage for publishing.
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    /// Enqueues raw bytes as if another producer had written them.
    ///
    /// Returns the offset assigned.
    pub fn inject_raw(&self, key: Option<&str>, payload: impl Into<Vec<u8>>) -> i64 {
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().push_back(Delivery {
            partition: 0,
            offset,
            key: key.map(str::to_string),
            payload: payload.into(),
        });
        offset
    }
}

#[async_trait]
impl EventProducer for MemoryBroker {
    async fn publish(&self, event: &TrackedEvent) -> Result<()> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(Error::transport("mock broker unavailable"));
        }

        let payload = serde_json::to_vec(event)?;
        self.inject_raw(Some(&event.broker_key()), payload);
        self.published.lock().push(event.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageSource for MemoryBroker {
    async fn fetch(&self, max_records: usize, max_wait: Duration) -> Result<Vec<Delivery>> {
        let batch: Vec<Delivery> = {
            let mut queue = self.queue.lock();
            let n = max_records.min(queue.len());
            queue.drain(..n).collect()
        };
        if batch.is_empty() {
            tokio::time::sleep(max_wait).await;
        }
        Ok(batch)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.acked.lock().push(delivery.offset);
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for MemoryBroker {
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        self.dead_letters.lock().push(letter.clone());
        Ok(())
    }
}

/// Platform stand-in: website directory, billing and automation rules.
pub struct MockPlatform {
    /// Public id -> website
    websites: Mutex<HashMap<String, Website>>,
    automations: Mutex<Vec<Automation>>,
    usage: Mutex<Vec<(String, u64)>>,
    entitled: AtomicBool,
    entitlement_unavailable: AtomicBool,
    resolve_calls: AtomicUsize,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self {
            websites: Mutex::new(HashMap::new()),
            automations: Mutex::new(Vec::new()),
            usage: Mutex::new(Vec::new()),
            entitled: AtomicBool::new(true),
            entitlement_unavailable: AtomicBool::new(false),
            resolve_calls: AtomicUsize::new(0),
        }
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_website(&self, public_id: &str, website: Website) {
        self.websites.lock().insert(public_id.to_string(), website);
    }

    pub fn add_automation(&self, automation: Automation) {
        self.automations.lock().push(automation);
    }

    pub fn set_entitled(&self, entitled: bool) {
        self.entitled.store(entitled, Ordering::SeqCst);
    }

    /// Makes the entitlement check itself fail.
    pub fn set_entitlement_unavailable(&self, unavailable: bool) {
        self.entitlement_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Usage increments received, in order.
    pub fn usage(&self) -> Vec<(String, u64)> {
        self.usage.lock().clone()
    }

    pub fn usage_total(&self) -> u64 {
        self.usage.lock().iter().map(|(_, count)| count).sum()
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WebsiteDirectory for MockPlatform {
    async fn resolve_website(&self, public_id: &str) -> Result<Website> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.websites.lock().get(public_id).cloned().ok_or_else(|| {
            Error::rejected(
                RejectionCode::UnknownWebsite,
                format!("unknown website {}", public_id),
            )
        })
    }
}

#[async_trait]
impl BillingService for MockPlatform {
    async fn can_record_event(&self, _tenant_id: &str) -> Result<bool> {
        if self.entitlement_unavailable.load(Ordering::SeqCst) {
            return Err(Error::collaborator("billing unavailable"));
        }
        Ok(self.entitled.load(Ordering::SeqCst))
    }

    async fn increment_usage(&self, tenant_id: &str, _kind: ResourceKind, count: u64) -> Result<()> {
        self.usage.lock().push((tenant_id.to_string(), count));
        Ok(())
    }
}

#[async_trait]
impl AutomationSource for MockPlatform {
    async fn list_active_automations(&self, website_id: &str) -> Result<Vec<Automation>> {
        Ok(self
            .automations
            .lock()
            .iter()
            .filter(|a| a.website_id == website_id && a.is_active)
            .cloned()
            .collect())
    }
}

/// Month-partitioned event store held in memory.
///
/// Writes into a partition that was never created count as failed rows,
/// as they would against a real table.
#[derive(Default)]
pub struct MemoryEventStore {
    partitions: Mutex<BTreeSet<PartitionKey>>,
    created: Mutex<Vec<PartitionKey>>,
    exists_checks: Mutex<Vec<PartitionKey>>,
    rows: Mutex<Vec<TrackedEvent>>,
    /// Partitions each write touched, and whether they all existed
    writes: Mutex<Vec<(Vec<PartitionKey>, bool)>>,
    should_fail: AtomicBool,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<TrackedEvent> {
        self.rows.lock().clone()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn rows_in(&self, key: PartitionKey) -> Vec<TrackedEvent> {
        self.rows
            .lock()
            .iter()
            .filter(|e| e.partition_key() == key)
            .cloned()
            .collect()
    }

    pub fn created_partitions(&self) -> Vec<PartitionKey> {
        self.created.lock().clone()
    }

    /// Every `partition_exists` call, i.e. one per provisioning check.
    pub fn exists_checks(&self) -> Vec<PartitionKey> {
        self.exists_checks.lock().clone()
    }

    pub fn writes(&self) -> Vec<(Vec<PartitionKey>, bool)> {
        self.writes.lock().clone()
    }

    /// Simulate a storage outage: every write errors.
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn partition_exists(&self, key: PartitionKey) -> Result<bool> {
        self.exists_checks.lock().push(key);
        Ok(self.partitions.lock().contains(&key))
    }

    async fn create_partition(&self, key: PartitionKey) -> Result<()> {
        if self.partitions.lock().insert(key) {
            self.created.lock().push(key);
        }
        Ok(())
    }

    async fn write_batch(&self, events: &[TrackedEvent]) -> Result<WriteOutcome> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(Error::storage("mock store unavailable"));
        }
        let partitions = self.partitions.lock().clone();
        let touched: BTreeSet<PartitionKey> = events.iter().map(|e| e.partition_key()).collect();
        let all_exist = touched.iter().all(|k| partitions.contains(k));
        self.writes
            .lock()
            .push((touched.into_iter().collect(), all_exist));

        let (stored, missing): (Vec<_>, Vec<_>) = events
            .iter()
            .cloned()
            .partition(|e| partitions.contains(&e.partition_key()));

        let mut outcome = WriteOutcome::stored(stored.len());
        for event in &missing {
            outcome.merge(WriteOutcome::rejected(event.partition_key(), 1));
        }
        self.rows.lock().extend(stored);
        Ok(outcome)
    }
}

/// Execution audit log held in memory, keyed by execution id.
#[derive(Default)]
pub struct MemoryExecutionStore {
    executions: Mutex<HashMap<Uuid, AutomationExecution>>,
    fail_history: AtomicBool,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a finished execution.
    pub fn insert(&self, execution: AutomationExecution) {
        self.executions.lock().insert(execution.id, execution);
    }

    pub fn executions(&self) -> Vec<AutomationExecution> {
        let mut all: Vec<_> = self.executions.lock().values().cloned().collect();
        all.sort_by_key(|e| e.started_at);
        all
    }

    pub fn executions_for(&self, automation_id: &str) -> Vec<AutomationExecution> {
        self.executions()
            .into_iter()
            .filter(|e| e.automation_id == automation_id)
            .collect()
    }

    /// Makes frequency lookups fail.
    pub fn set_fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn start_execution(&self, execution: &AutomationExecution) -> Result<()> {
        self.insert(execution.clone());
        Ok(())
    }

    async fn finish_execution(&self, execution: &AutomationExecution) -> Result<()> {
        self.insert(execution.clone());
        Ok(())
    }

    async fn has_successful_execution(
        &self,
        automation_id: &str,
        scope: &ExecutionScope,
    ) -> Result<bool> {
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(Error::storage("execution history unavailable"));
        }

        let executions = self.executions.lock();
        Ok(executions.values().any(|e| {
            e.automation_id == automation_id
                && e.status == ExecutionStatus::Success
                && match scope {
                    ExecutionScope::Session(session) => e.session_id.as_deref() == Some(session),
                    ExecutionScope::Visitor(visitor) => e.visitor_id.as_deref() == Some(visitor),
                    ExecutionScope::VisitorSince(visitor, since) => {
                        e.visitor_id.as_deref() == Some(visitor) && e.started_at >= *since
                    }
                }
        }))
    }
}

/// Mailer that records every email instead of sending it.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<(EmailAction, TriggerPayload)>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(EmailAction, TriggerPayload)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &EmailAction, payload: &TriggerPayload) -> Result<()> {
        self.sent.lock().push((email.clone(), payload.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use engine_core::EventInput;

    fn event_at(month: u32) -> TrackedEvent {
        let ts = Utc.with_ymd_and_hms(2026, month, 10, 12, 0, 0).unwrap();
        TrackedEvent::from_input(EventInput::default(), "site-1", ts)
    }

    #[tokio::test]
    async fn test_broker_round_trip() {
        let broker = MemoryBroker::new();
        let event = event_at(3);
        broker.publish(&event).await.unwrap();

        let fetched = broker.fetch(10, Duration::from_millis(1)).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].key.as_deref(), Some(event.broker_key().as_str()));

        let decoded: TrackedEvent = serde_json::from_slice(&fetched[0].payload).unwrap();
        assert_eq!(decoded, event);
    }

    #[tokio::test]
    async fn test_broker_failure() {
        let broker = MemoryBroker::new();
        broker.set_should_fail(true);
        assert!(broker.publish(&event_at(3)).await.is_err());
        assert_eq!(broker.publish_count(), 0);
    }

    #[tokio::test]
    async fn test_store_rejects_rows_without_partition() {
        let store = MemoryEventStore::new();
        let march = event_at(3);
        store.create_partition(march.partition_key()).await.unwrap();

        let outcome = store.write_batch(&[march, event_at(4)]).await.unwrap();
        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.failed, 1);
        assert!(!store.writes()[0].1);
    }
}
