//! Automation rule and execution audit types.
//!
//! Triggers, conditions and actions arrive from the platform as
//! `{ "type": ..., "config": {...} }` objects. Each is decoded into a closed
//! enum; tags this build does not know land in an `Unknown` variant so the
//! engine can treat them explicitly instead of failing the whole rule set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::events::TrackedEvent;

/// Wire shape shared by triggers, conditions and actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRule {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: Value,
}

impl RawRule {
    pub fn new(kind: impl Into<String>, config: Value) -> Self {
        Self {
            kind: kind.into(),
            config,
        }
    }

    fn config_str(&self, key: &str) -> Option<String> {
        self.config
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// What kind of event starts an automation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawRule")]
pub enum Trigger {
    /// Any pageview
    Pageview,
    /// A custom event with the configured name
    Event { event_name: String },
    /// Visitor leaving a page
    PageExit,
    /// Tag not known to this build
    Unknown(String),
}

impl From<RawRule> for Trigger {
    fn from(raw: RawRule) -> Self {
        match raw.kind.as_str() {
            "pageview" => Self::Pageview,
            "event" => Self::Event {
                event_name: raw.config_str("event_name").unwrap_or_default(),
            },
            "page_exit" => Self::PageExit,
            _ => Self::Unknown(raw.kind.clone()),
        }
    }
}

/// String comparison used by conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Unknown(String),
}

impl From<&str> for Operator {
    fn from(s: &str) -> Self {
        match s {
            "equals" | "eq" | "" => Self::Equals,
            "not_equals" | "neq" => Self::NotEquals,
            "contains" => Self::Contains,
            "not_contains" => Self::NotContains,
            "starts_with" => Self::StartsWith,
            "ends_with" => Self::EndsWith,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Operator plus expected value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matcher {
    pub operator: Operator,
    pub value: String,
}

impl Matcher {
    pub fn new(operator: Operator, value: impl Into<String>) -> Self {
        Self {
            operator,
            value: value.into(),
        }
    }

    fn from_config(raw: &RawRule) -> Option<Self> {
        let value = raw.config_str("value")?;
        let operator = raw.config_str("operator").unwrap_or_default();
        Some(Self {
            operator: Operator::from(operator.as_str()),
            value,
        })
    }
}

/// A gate evaluated against the trigger payload; all must pass.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawRule")]
pub enum Condition {
    PagePath(Matcher),
    Referrer(Matcher),
    Country(Matcher),
    DeviceType(Matcher),
    Browser(Matcher),
    Os(Matcher),
    Property { key: String, matcher: Matcher },
    /// Known tag whose config could not be read
    Invalid { kind: String, reason: String },
    /// Tag not known to this build
    Unknown(String),
}

impl From<RawRule> for Condition {
    fn from(raw: RawRule) -> Self {
        let wrap = |build: fn(Matcher) -> Condition| match Matcher::from_config(&raw) {
            Some(matcher) => build(matcher),
            None => Condition::Invalid {
                kind: raw.kind.clone(),
                reason: "missing string `value`".to_string(),
            },
        };

        match raw.kind.as_str() {
            "page_path" | "url_path" => wrap(Condition::PagePath),
            "referrer" => wrap(Condition::Referrer),
            "country" => wrap(Condition::Country),
            "device_type" | "device" => wrap(Condition::DeviceType),
            "browser" => wrap(Condition::Browser),
            "os" => wrap(Condition::Os),
            "property" => match (raw.config_str("key"), Matcher::from_config(&raw)) {
                (Some(key), Some(matcher)) => Condition::Property { key, matcher },
                _ => Condition::Invalid {
                    kind: raw.kind.clone(),
                    reason: "property condition needs `key` and `value`".to_string(),
                },
            },
            _ => Condition::Unknown(raw.kind.clone()),
        }
    }
}

/// HTTP call made by a webhook action.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookAction {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    /// Static body merged over the trigger payload
    pub body: Map<String, Value>,
}

/// Email sent by an email action.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailAction {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// One step of an automation, run in declared order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawRule")]
pub enum Action {
    Webhook(WebhookAction),
    Email(EmailAction),
    /// Client-consumed directive
    Script,
    /// Client-consumed directive
    Banner,
    /// Known tag whose config could not be read
    Invalid { kind: String, reason: String },
    /// Tag not known to this build
    Unknown(String),
}

impl Action {
    pub fn kind(&self) -> &str {
        match self {
            Self::Webhook(_) => "webhook",
            Self::Email(_) => "email",
            Self::Script => "script",
            Self::Banner => "banner",
            Self::Invalid { kind, .. } => kind,
            Self::Unknown(kind) => kind,
        }
    }
}

impl From<RawRule> for Action {
    fn from(raw: RawRule) -> Self {
        match raw.kind.as_str() {
            "webhook" => {
                let Some(url) = raw.config_str("url").filter(|u| !u.is_empty()) else {
                    return Self::Invalid {
                        kind: raw.kind.clone(),
                        reason: "webhook needs a `url`".to_string(),
                    };
                };
                let headers = raw
                    .config
                    .get("headers")
                    .and_then(Value::as_object)
                    .map(|h| {
                        h.iter()
                            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                            .collect()
                    })
                    .unwrap_or_default();
                let body = raw
                    .config
                    .get("body")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                Self::Webhook(WebhookAction {
                    url,
                    method: raw
                        .config_str("method")
                        .map(|m| m.to_ascii_uppercase())
                        .unwrap_or_else(|| "POST".to_string()),
                    headers,
                    body,
                })
            }
            "email" => Self::Email(EmailAction {
                to: raw.config_str("to").unwrap_or_default(),
                subject: raw.config_str("subject").unwrap_or_default(),
                body: raw.config_str("body").unwrap_or_default(),
            }),
            "script" => Self::Script,
            "banner" => Self::Banner,
            _ => Self::Unknown(raw.kind.clone()),
        }
    }
}

/// How often one automation may fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Frequency {
    #[default]
    Always,
    OncePerSession,
    OncePerVisitor,
    OncePerDay,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::OncePerSession => "once_per_session",
            Self::OncePerVisitor => "once_per_visitor",
            Self::OncePerDay => "once_per_day",
        }
    }
}

impl From<String> for Frequency {
    fn from(s: String) -> Self {
        match s.as_str() {
            "once_per_session" => Self::OncePerSession,
            "once_per_visitor" => Self::OncePerVisitor,
            "once_per_day" => Self::OncePerDay,
            _ => Self::Always,
        }
    }
}

impl From<Frequency> for String {
    fn from(f: Frequency) -> Self {
        f.as_str().to_string()
    }
}

/// Tenant-owned rule attached to one website.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Automation {
    pub id: String,
    #[serde(alias = "websiteId")]
    pub website_id: String,
    #[serde(default)]
    pub name: String,
    pub trigger: Trigger,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub frequency: Frequency,
    #[serde(default = "default_true", alias = "isActive")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Snapshot of the event that fired an automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerPayload {
    pub event_id: Uuid,
    pub website_id: String,
    pub visitor_id: String,
    pub session_id: String,
    pub event_type: String,
    pub event_name: Option<String>,
    pub page_path: String,
    pub referrer: Option<String>,
    pub country: Option<String>,
    pub device_type: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub properties: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl From<&TrackedEvent> for TriggerPayload {
    fn from(event: &TrackedEvent) -> Self {
        Self {
            event_id: event.id,
            website_id: event.website_id.clone(),
            visitor_id: event.visitor_id.clone(),
            session_id: event.session_id.clone(),
            event_type: event.event_type.clone(),
            event_name: event.event_name.clone(),
            page_path: event.page_path.clone(),
            referrer: event.referrer.clone(),
            country: event.country.clone(),
            device_type: event.device_type.clone(),
            browser: event.browser.clone(),
            os: event.os.clone(),
            properties: event.properties.clone(),
            timestamp: event.timestamp,
        }
    }
}

impl TriggerPayload {
    /// JSON object form used for webhook bodies and the audit snapshot.
    pub fn to_json(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Lifecycle state of one automation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Audit record of one automation run against one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationExecution {
    pub id: Uuid,
    pub automation_id: String,
    pub website_id: String,
    pub visitor_id: Option<String>,
    pub session_id: Option<String>,
    pub status: ExecutionStatus,
    pub trigger_payload: Value,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AutomationExecution {
    /// Opens a `running` record.
    pub fn start(automation: &Automation, payload: &TriggerPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            automation_id: automation.id.clone(),
            website_id: payload.website_id.clone(),
            visitor_id: Some(payload.visitor_id.clone()),
            session_id: Some(payload.session_id.clone()),
            status: ExecutionStatus::Running,
            trigger_payload: Value::Object(payload.to_json()),
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn succeed(&mut self) {
        self.status = ExecutionStatus::Success;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = ExecutionStatus::Failed;
        self.error_message = Some(error.into());
        self.completed_at = Some(Utc::now());
    }
}

/// History window consulted by frequency control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionScope {
    Session(String),
    Visitor(String),
    /// Same visitor since the given instant
    VisitorSince(String, DateTime<Utc>),
}
