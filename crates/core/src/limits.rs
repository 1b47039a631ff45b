//! Size and rate limits for the ingestion pipeline.
//!
//! Limits are enforced at the gateway before anything is published, so a
//! rejected request never reaches the broker.

// === Request Limits ===

/// Maximum batch request body in bytes (1MB).
pub const MAX_BATCH_SIZE_BYTES: usize = 1024 * 1024;

/// Maximum events per batch request.
pub const MAX_BATCH_EVENTS: usize = 1000;

/// Maximum single-event request body in bytes (64KB).
pub const MAX_EVENT_SIZE_BYTES: usize = 64 * 1024;

/// Maximum free-form properties JSON size in bytes (16KB).
pub const MAX_PROPERTIES_BYTES: usize = 16 * 1024;

// === Identifier Limits ===

/// Public website id pattern: short url-safe token.
pub const PUBLIC_SITE_ID_PATTERN: &str = r"^[A-Za-z0-9_-]{1,64}$";

/// Visitor / session id max length.
pub const MAX_VISITOR_ID_LEN: usize = 128;

/// Page path max length.
pub const MAX_PATH_LEN: usize = 2048;

/// Custom event name (and event type) max length.
pub const MAX_EVENT_NAME_LEN: usize = 100;

/// Referrer URL max length.
pub const MAX_REFERRER_LEN: usize = 2048;

/// User agent max length.
pub const MAX_USER_AGENT_LEN: usize = 512;

/// Textual IPv6 address max length.
pub const MAX_IP_LEN: usize = 45;

// === Timestamp Window ===

/// Oldest accepted client timestamp, in days before receipt.
pub const MAX_EVENT_AGE_DAYS: i64 = 45;

/// Furthest accepted client timestamp, in minutes after receipt.
pub const MAX_CLOCK_SKEW_MINUTES: i64 = 10;

// === Pipeline Defaults ===

/// Default collector flush threshold (events).
pub const DEFAULT_FLUSH_BATCH_SIZE: usize = 500;

/// Default collector flush interval (milliseconds).
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1000;

/// Default usage channel capacity.
pub const DEFAULT_USAGE_QUEUE_CAPACITY: usize = 10_000;

/// Webhook action timeout (seconds).
pub const WEBHOOK_TIMEOUT_SECS: u64 = 10;
