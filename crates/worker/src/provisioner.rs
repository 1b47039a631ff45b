//! Lazy creation of monthly event partitions.
//!
//! Verified keys are remembered in memory so the steady state issues no
//! storage I/O. With `reverify_after` set, a key older than that is checked
//! again on its next use; by default a key stays verified for the life of
//! the process.

use chrono::{DateTime, Utc};
use engine_core::{EventStore, PartitionKey, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::metrics;
use tracing::{debug, info, warn};

pub struct PartitionProvisioner {
    store: Arc<dyn EventStore>,
    verified: Mutex<HashMap<PartitionKey, Instant>>,
    reverify_after: Option<Duration>,
}

impl PartitionProvisioner {
    pub fn new(store: Arc<dyn EventStore>, reverify_after: Option<Duration>) -> Self {
        Self {
            store,
            verified: Mutex::new(HashMap::new()),
            reverify_after,
        }
    }

    /// Guarantees the partition for `timestamp` exists.
    pub async fn ensure(&self, timestamp: DateTime<Utc>) -> Result<PartitionKey> {
        let key = PartitionKey::from_timestamp(timestamp);
        self.ensure_key(key).await?;
        Ok(key)
    }

    pub async fn ensure_key(&self, key: PartitionKey) -> Result<()> {
        if self.is_verified(key) {
            return Ok(());
        }

        let exists = self.store.partition_exists(key).await.inspect_err(|e| {
            metrics().partition_errors.inc();
            warn!(partition = %key, error = %e, "Partition existence check failed");
        })?;

        if exists {
            debug!(partition = %key, "Partition already exists");
        } else {
            self.store.create_partition(key).await.inspect_err(|e| {
                metrics().partition_errors.inc();
                warn!(partition = %key, error = %e, "Partition creation failed");
            })?;
            metrics().partitions_created.inc();
            info!(
                partition = %key,
                table = %key.table_name(),
                "Created event partition"
            );
        }

        self.verified.lock().insert(key, Instant::now());
        Ok(())
    }

    /// Whether `key` is in the verified set and not due for re-verification.
    pub fn is_verified(&self, key: PartitionKey) -> bool {
        let verified = self.verified.lock();
        match (verified.get(&key), self.reverify_after) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(at), Some(ttl)) => at.elapsed() < ttl,
        }
    }
}
