//! Redpanda producer using rskafka.

use crate::config::RedpandaConfig;
use crate::connection::{compression, connect};
use crate::consumer::{DeadLetter, DeadLetterSink};
use crate::partitioner::partition_for;
use async_trait::async_trait;
use chrono::Utc;
use engine_core::{Error, Result, TrackedEvent};
use rskafka::client::{
    partition::{PartitionClient, UnknownTopicHandling},
    Client,
};
use rskafka::record::Record;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::metrics;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// Hands canonical events to the broker.
#[async_trait]
pub trait EventProducer: Send + Sync {
    /// Returns once the broker accepted the send.
    async fn publish(&self, event: &TrackedEvent) -> Result<()>;

    /// Stops accepting sends; later publishes fail.
    async fn close(&self) {}
}

/// Redpanda producer for tracked events and dead letters.
pub struct Producer {
    client: Client,
    config: RedpandaConfig,
    /// Cached partition clients keyed by (topic, partition)
    clients: RwLock<BTreeMap<(String, i32), Arc<PartitionClient>>>,
    closed: AtomicBool,
}

impl Producer {
    /// Connects to the cluster.
    pub async fn new(config: RedpandaConfig) -> Result<Self> {
        let client = connect(&config).await?;
        info!(
            brokers = %config.broker_string(),
            topic = %config.topic,
            "Redpanda producer connected"
        );

        Ok(Self {
            client,
            config,
            clients: RwLock::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Gets or creates a partition client.
    async fn get_client(&self, topic: &str, partition: i32) -> Result<Arc<PartitionClient>> {
        let key = (topic.to_string(), partition);

        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(&key) {
                return Ok(client.clone());
            }
        }

        let partition_client = self
            .client
            .partition_client(topic.to_string(), partition, UnknownTopicHandling::Retry)
            .await
            .map_err(|e| Error::transport(format!("failed to get partition client: {}", e)))?;
        let partition_client = Arc::new(partition_client);

        self.clients
            .write()
            .await
            .insert(key, partition_client.clone());

        Ok(partition_client)
    }

    async fn send(&self, topic: &str, partition: i32, record: Record) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }

        let client = self.get_client(topic, partition).await?;
        let timeout = Duration::from_millis(self.config.request_timeout_ms);

        match tokio::time::timeout(timeout, client.produce(vec![record], compression(&self.config)))
            .await
        {
            Ok(Ok(_offsets)) => Ok(()),
            Ok(Err(e)) => {
                // Drop the cached client so the next send reconnects
                self.clients
                    .write()
                    .await
                    .remove(&(topic.to_string(), partition));
                Err(Error::transport(format!("failed to produce: {}", e)))
            }
            Err(_) => Err(Error::transport(format!(
                "produce to {} timed out after {}ms",
                topic, self.config.request_timeout_ms
            ))),
        }
    }
}

#[async_trait]
impl EventProducer for Producer {
    async fn publish(&self, event: &TrackedEvent) -> Result<()> {
        let start = Instant::now();
        let key = event.broker_key();
        let payload = serde_json::to_vec(event)?;
        let partition = partition_for(&key, self.config.partitions);

        let record = Record {
            key: Some(key.into_bytes()),
            value: Some(payload),
            headers: BTreeMap::new(),
            timestamp: Utc::now(),
        };

        match self.send(&self.config.topic, partition, record).await {
            Ok(()) => {
                let elapsed = start.elapsed();
                metrics().events_published.inc();
                metrics()
                    .publish_latency_ms
                    .observe(elapsed.as_millis() as u64);
                debug!(
                    event_id = %event.id,
                    website_id = %event.website_id,
                    partition = partition,
                    latency_ms = %elapsed.as_millis(),
                    "Published event"
                );
                Ok(())
            }
            Err(e) => {
                metrics().publish_errors.inc();
                error!(
                    event_id = %event.id,
                    website_id = %event.website_id,
                    error = %e,
                    "Failed to publish event"
                );
                Err(e)
            }
        }
    }

    /// Releases partition connections.
    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.clients.write().await.clear();
        info!("Redpanda producer closed");
    }
}

#[async_trait]
impl DeadLetterSink for Producer {
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        let payload = serde_json::to_vec(letter)?;
        let mut headers = BTreeMap::new();
        headers.insert("reason".to_string(), letter.reason.as_str().as_bytes().to_vec());

        let record = Record {
            key: letter.key.clone().map(String::into_bytes),
            value: Some(payload),
            headers,
            timestamp: Utc::now(),
        };

        self.send(&self.config.dead_letter_topic, 0, record).await
    }
}
