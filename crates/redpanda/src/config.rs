//! Redpanda configuration.

use serde::{Deserialize, Serialize};

/// Redpanda connection and producer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedpandaConfig {
    /// Broker addresses
    pub brokers: Vec<String>,
    /// Topic tracked events are published to
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Topic receiving messages that could not be processed
    #[serde(default = "default_dead_letter_topic")]
    pub dead_letter_topic: String,
    /// Number of partitions of `topic`; messages are routed by key hash
    #[serde(default = "default_partitions")]
    pub partitions: i32,
    /// Compression type (none, gzip, snappy, lz4, zstd)
    #[serde(default = "default_compression")]
    pub compression: String,
    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// SASL username (Redpanda Cloud)
    #[serde(default)]
    pub sasl_username: Option<String>,
    /// SASL password (Redpanda Cloud)
    #[serde(default)]
    pub sasl_password: Option<String>,
    #[serde(default)]
    pub consumer: ConsumerConfig,
}

fn default_topic() -> String {
    "tracked-events".to_string()
}

fn default_dead_letter_topic() -> String {
    "tracked-events-dlq".to_string()
}

fn default_partitions() -> i32 {
    1
}

fn default_compression() -> String {
    "lz4".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

impl Default for RedpandaConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            topic: default_topic(),
            dead_letter_topic: default_dead_letter_topic(),
            partitions: default_partitions(),
            compression: default_compression(),
            request_timeout_ms: default_request_timeout_ms(),
            sasl_username: None,
            sasl_password: None,
            consumer: ConsumerConfig::default(),
        }
    }
}

impl RedpandaConfig {
    /// Returns the broker list as a comma-separated string.
    pub fn broker_string(&self) -> String {
        self.brokers.join(",")
    }

    /// SASL credentials, if both halves are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.sasl_username, &self.sasl_password) {
            (Some(u), Some(p)) if !u.is_empty() => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }
}

/// Where a fresh consumer starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartOffset {
    Earliest,
    #[default]
    Latest,
}

/// Pull consumer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Maximum records handled per fetch
    #[serde(default = "default_fetch_max_records")]
    pub fetch_max_records: usize,
    /// Upper bound on bytes returned by one fetch
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: i32,
    /// Bounded wait for a fetch when the partition is idle
    #[serde(default = "default_fetch_wait_ms")]
    pub fetch_wait_ms: u64,
    /// Handler retries before a message is dead-lettered
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
    /// Base delay between redeliveries; grows linearly with the attempt
    #[serde(default = "default_redelivery_backoff_ms")]
    pub redelivery_backoff_ms: u64,
    #[serde(default)]
    pub start_offset: StartOffset,
}

fn default_fetch_max_records() -> usize {
    500
}

fn default_fetch_max_bytes() -> i32 {
    4 * 1024 * 1024
}

fn default_fetch_wait_ms() -> u64 {
    1000
}

fn default_max_redeliveries() -> u32 {
    3
}

fn default_redelivery_backoff_ms() -> u64 {
    200
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            fetch_max_records: default_fetch_max_records(),
            fetch_max_bytes: default_fetch_max_bytes(),
            fetch_wait_ms: default_fetch_wait_ms(),
            max_redeliveries: default_max_redeliveries(),
            redelivery_backoff_ms: default_redelivery_backoff_ms(),
            start_offset: StartOffset::default(),
        }
    }
}
