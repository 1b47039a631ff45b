//! Dependency health tracking.
//!
//! Each external dependency has one slot that the code talking to it
//! updates. Components marked as gating decide readiness; the others only
//! degrade the reported status.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Overall status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone)]
struct Probe {
    healthy: bool,
    message: Option<String>,
    changed_at: Option<DateTime<Utc>>,
}

/// Health slot for one dependency.
#[derive(Debug)]
pub struct ComponentHealth {
    name: &'static str,
    gates_readiness: bool,
    probe: RwLock<Probe>,
}

impl ComponentHealth {
    /// Starts unhealthy until the first successful check.
    pub const fn new(name: &'static str, gates_readiness: bool) -> Self {
        Self {
            name,
            gates_readiness,
            probe: RwLock::new(Probe {
                healthy: false,
                message: None,
                changed_at: None,
            }),
        }
    }

    pub fn set_healthy(&self) {
        self.update(true, None);
    }

    pub fn set_unhealthy(&self, msg: impl Into<String>) {
        self.update(false, Some(msg.into()));
    }

    fn update(&self, healthy: bool, message: Option<String>) {
        let mut probe = self.probe.write();
        if probe.healthy != healthy || probe.changed_at.is_none() {
            probe.changed_at = Some(Utc::now());
            if healthy {
                tracing::info!(component = self.name, "Dependency healthy");
            } else {
                tracing::warn!(component = self.name, reason = ?message, "Dependency unhealthy");
            }
        }
        probe.healthy = healthy;
        probe.message = message;
    }

    pub fn is_healthy(&self) -> bool {
        self.probe.read().healthy
    }

    pub fn report(&self) -> ComponentHealthReport {
        let probe = self.probe.read().clone();
        ComponentHealthReport {
            name: self.name.to_string(),
            healthy: probe.healthy,
            gates_readiness: self.gates_readiness,
            message: probe.message,
            since: probe.changed_at,
        }
    }
}

/// Aggregated health status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealthReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealthReport {
    pub name: String,
    pub healthy: bool,
    pub gates_readiness: bool,
    pub message: Option<String>,
    /// Last transition; `None` before the first check
    pub since: Option<DateTime<Utc>>,
}

/// Dependencies of the ingestion service.
pub struct HealthRegistry {
    /// Gateway publishing and pipeline consumption
    pub redpanda: ComponentHealth,
    /// Batch writes; an outage backs up in the broker
    pub clickhouse: ComponentHealth,
    /// Website resolution, entitlement and automation rules
    pub platform: ComponentHealth,
}

impl HealthRegistry {
    pub const fn new() -> Self {
        Self {
            redpanda: ComponentHealth::new("redpanda", true),
            clickhouse: ComponentHealth::new("clickhouse", false),
            platform: ComponentHealth::new("platform", true),
        }
    }

    fn components(&self) -> [&ComponentHealth; 3] {
        [&self.redpanda, &self.clickhouse, &self.platform]
    }

    pub fn report(&self) -> HealthReport {
        let components: Vec<_> = self.components().iter().map(|c| c.report()).collect();

        let healthy = components.iter().filter(|c| c.healthy).count();
        let status = match healthy {
            n if n == components.len() => HealthStatus::Healthy,
            0 => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        };

        HealthReport { status, components }
    }

    /// Whether intake can accept traffic: every gating dependency is up.
    pub fn is_ready(&self) -> bool {
        self.components()
            .iter()
            .filter(|c| c.gates_readiness)
            .all(|c| c.is_healthy())
    }

    /// The process is running; dependencies do not matter.
    pub fn is_alive(&self) -> bool {
        true
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static HEALTH: HealthRegistry = HealthRegistry::new();

/// Process-wide registry.
pub fn health() -> &'static HealthRegistry {
    &HEALTH
}
