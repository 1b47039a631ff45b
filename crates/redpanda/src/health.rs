//! Redpanda health checks.

use crate::config::RedpandaConfig;
use crate::connection::connect;
use tracing::{debug, error};

/// Check Redpanda connection health.
pub async fn check_connection(config: &RedpandaConfig) -> bool {
    let client = match connect(config).await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to connect to Redpanda: {}", e);
            return false;
        }
    };

    match client.list_topics().await {
        Ok(topics) => {
            debug!(topics = topics.len(), "Redpanda connection healthy");
            true
        }
        Err(e) => {
            error!("Failed to list Redpanda topics: {}", e);
            false
        }
    }
}

/// Returns the configured topics that do not exist on the cluster.
pub async fn missing_topics(config: &RedpandaConfig) -> Vec<String> {
    let wanted = [config.topic.as_str(), config.dead_letter_topic.as_str()];
    let all = || wanted.iter().map(|t| t.to_string()).collect();

    let Ok(client) = connect(config).await else {
        return all();
    };

    match client.list_topics().await {
        Ok(existing) => {
            let existing: std::collections::HashSet<_> =
                existing.iter().map(|t| t.name.as_str()).collect();
            wanted
                .iter()
                .filter(|t| !existing.contains(*t))
                .map(|t| t.to_string())
                .collect()
        }
        Err(_) => all(),
    }
}
