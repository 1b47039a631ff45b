//! Event type definitions for the ingestion pipeline.
//!
//! `EventInput` is what a tracker sends; `TrackedEvent` is the canonical,
//! enriched form that travels through the broker and lands in storage.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::error::{Error, RejectionCode};
use crate::limits::{
    MAX_CLOCK_SKEW_MINUTES, MAX_EVENT_AGE_DAYS, MAX_EVENT_NAME_LEN, MAX_IP_LEN, MAX_PATH_LEN,
    MAX_PROPERTIES_BYTES, MAX_REFERRER_LEN, MAX_USER_AGENT_LEN, MAX_VISITOR_ID_LEN,
};
use crate::partition::PartitionKey;

/// Event type assigned when the tracker omits one.
pub const PAGEVIEW: &str = "pageview";

/// Event type emitted when a visitor leaves a page.
pub const PAGE_EXIT: &str = "page_exit";

/// Validates properties JSON size.
fn validate_properties_size(props: &Map<String, Value>) -> Result<(), ValidationError> {
    if props.is_empty() {
        return Ok(());
    }

    let size = serde_json::to_vec(props).map(|v| v.len()).unwrap_or(0);

    if size > MAX_PROPERTIES_BYTES {
        let mut err = ValidationError::new("properties_too_large");
        err.message = Some(
            format!(
                "properties {}KB exceeds {}KB limit",
                size / 1024,
                MAX_PROPERTIES_BYTES / 1024
            )
            .into(),
        );
        return Err(err);
    }
    Ok(())
}

/// One event as received from a tracker, before enrichment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct EventInput {
    /// Public website id (any alias the tracker was configured with)
    #[serde(default, alias = "siteId", alias = "siteID", alias = "site_id")]
    pub website_id: String,
    #[validate(length(max = (MAX_VISITOR_ID_LEN as u64)))]
    #[serde(default, alias = "visitorId")]
    pub visitor_id: Option<String>,
    #[validate(length(max = (MAX_VISITOR_ID_LEN as u64)))]
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
    /// Defaults to `pageview`
    #[validate(length(min = 1, max = (MAX_EVENT_NAME_LEN as u64)))]
    #[serde(default, alias = "eventType", alias = "type")]
    pub event_type: Option<String>,
    /// Name of a custom event
    #[validate(length(min = 1, max = (MAX_EVENT_NAME_LEN as u64)))]
    #[serde(default, alias = "eventName", alias = "name")]
    pub event_name: Option<String>,
    #[validate(length(max = (MAX_PATH_LEN as u64)))]
    #[serde(default, alias = "pagePath", alias = "path")]
    pub page_path: String,
    #[validate(length(max = (MAX_REFERRER_LEN as u64)))]
    #[serde(default)]
    pub referrer: Option<String>,
    #[validate(length(max = (MAX_USER_AGENT_LEN as u64)))]
    #[serde(default, alias = "userAgent")]
    pub user_agent: Option<String>,
    #[validate(length(max = (MAX_IP_LEN as u64)))]
    #[serde(default)]
    pub ip: Option<String>,

    // Derived fields; filled by enrichment only if absent
    #[serde(default)]
    pub browser: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default, alias = "deviceType", alias = "device")]
    pub device_type: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub continent: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,

    #[validate(custom(function = "validate_properties_size"))]
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// Occurrence time; defaults to receipt time
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl EventInput {
    /// Rejects a client timestamp outside the accepted window around `now`.
    ///
    /// Storage is partitioned by month, so an unbounded timestamp would
    /// create a table per distinct month sent.
    pub fn check_timestamp(&self, now: DateTime<Utc>) -> crate::Result<()> {
        let Some(ts) = self.timestamp else {
            return Ok(());
        };
        let earliest = now - Duration::days(MAX_EVENT_AGE_DAYS);
        let latest = now + Duration::minutes(MAX_CLOCK_SKEW_MINUTES);
        if ts < earliest || ts > latest {
            return Err(Error::rejected(
                RejectionCode::InvalidPayload,
                format!(
                    "timestamp {} is outside the accepted window ({} days back, {} minutes ahead)",
                    ts.to_rfc3339(),
                    MAX_EVENT_AGE_DAYS,
                    MAX_CLOCK_SKEW_MINUTES
                ),
            ));
        }
        Ok(())
    }
}

/// Canonical event published to the broker and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEvent {
    pub id: Uuid,
    /// Canonical website id
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
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// When the action happened
    pub timestamp: DateTime<Utc>,
    /// When the gateway accepted it
    pub created_at: DateTime<Utc>,
}

impl TrackedEvent {
    /// Build a canonical event from tracker input.
    ///
    /// Applies defaults (`pageview`, receipt time, generated visitor/session
    /// ids) and force-writes the canonical website id.
    pub fn from_input(input: EventInput, canonical_website_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            website_id: canonical_website_id.to_string(),
            visitor_id: non_empty(input.visitor_id).unwrap_or_else(|| Uuid::new_v4().to_string()),
            session_id: non_empty(input.session_id).unwrap_or_else(|| Uuid::new_v4().to_string()),
            event_type: non_empty(input.event_type).unwrap_or_else(|| PAGEVIEW.to_string()),
            event_name: non_empty(input.event_name),
            page_path: if input.page_path.is_empty() {
                "/".to_string()
            } else {
                input.page_path
            },
            referrer: non_empty(input.referrer),
            user_agent: non_empty(input.user_agent),
            ip: non_empty(input.ip),
            browser: non_empty(input.browser),
            browser_version: None,
            os: non_empty(input.os),
            device_type: non_empty(input.device_type),
            country: non_empty(input.country),
            city: non_empty(input.city),
            continent: non_empty(input.continent),
            latitude: input.latitude,
            longitude: input.longitude,
            properties: input.properties,
            timestamp: input.timestamp.unwrap_or(now),
            created_at: now,
        }
    }

    /// Storage partition this event belongs to.
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::from_timestamp(self.timestamp)
    }

    /// Broker message key (keeps one session on one partition).
    pub fn broker_key(&self) -> String {
        format!("{}:{}", self.website_id, self.session_id)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Batch of events sharing one website id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEventRequest {
    #[serde(alias = "siteId", alias = "siteID", alias = "website_id")]
    pub site_id: String,
    pub events: Vec<EventInput>,
}

/// Outcome of a single-event ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackEventResponse {
    pub status: String,
    #[serde(rename = "eventID")]
    pub event_id: Uuid,
    #[serde(rename = "visitorID")]
    pub visitor_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
}

impl TrackEventResponse {
    pub fn accepted(event: &TrackedEvent) -> Self {
        Self {
            status: "accepted".to_string(),
            event_id: event.id,
            visitor_id: event.visitor_id.clone(),
            session_id: event.session_id.clone(),
        }
    }
}

/// Outcome of a batch ingestion: aggregate accepted count only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEventResponse {
    pub status: String,
    pub events_count: usize,
    pub processed_at: DateTime<Utc>,
}

impl BatchEventResponse {
    pub fn accepted(events_count: usize) -> Self {
        Self {
            status: "accepted".to_string(),
            events_count,
            processed_at: Utc::now(),
        }
    }
}
