//! Unified error types for the ingestion pipeline.
//!
//! Rejections carry a code from a small fixed vocabulary:
//! - SITE_001-002: Website resolution
//! - ORIGIN_001: Origin validation
//! - QUOTA_001-002: Entitlement checks
//! - VALID_001-003: Payload validation
//! - BROKER_001: Broker hand-off
//! - SHUTDOWN_001: Intake closed

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Rejection codes returned synchronously to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionCode {
    /// SITE_001: Website id is unknown
    UnknownWebsite,
    /// SITE_002: Website exists but is inactive
    InactiveWebsite,
    /// ORIGIN_001: Declared origin does not match the registered domain
    OriginMismatch,
    /// QUOTA_001: Tenant is not entitled to record more events
    QuotaExceeded,
    /// QUOTA_002: Entitlement could not be checked
    EntitlementUnavailable,
    /// VALID_001: Malformed payload
    InvalidPayload,
    /// VALID_002: Batch exceeds the event or byte limit
    BatchTooLarge,
    /// VALID_003: Properties blob exceeds the size limit
    PropertiesTooLarge,
    /// BROKER_001: Broker refused the event
    PublishFailed,
    /// SHUTDOWN_001: Intake is closed
    Shutdown,
}

impl RejectionCode {
    /// Get the error code string.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownWebsite => "SITE_001",
            Self::InactiveWebsite => "SITE_002",
            Self::OriginMismatch => "ORIGIN_001",
            Self::QuotaExceeded => "QUOTA_001",
            Self::EntitlementUnavailable => "QUOTA_002",
            Self::InvalidPayload => "VALID_001",
            Self::BatchTooLarge => "VALID_002",
            Self::PropertiesTooLarge => "VALID_003",
            Self::PublishFailed => "BROKER_001",
            Self::Shutdown => "SHUTDOWN_001",
        }
    }

    /// Get the HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::UnknownWebsite => 404,
            Self::InactiveWebsite => 403,
            Self::OriginMismatch => 403,
            Self::QuotaExceeded => 429,
            Self::EntitlementUnavailable => 503,
            Self::InvalidPayload => 400,
            Self::BatchTooLarge => 413,
            Self::PropertiesTooLarge => 413,
            Self::PublishFailed => 502,
            Self::Shutdown => 503,
        }
    }
}

/// Unified error type for the ingestion pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller-facing rejection with code. Never has side effects.
    #[error("[{code}] {message}")]
    Rejected {
        code: &'static str,
        message: String,
        http_status: u16,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("broker error: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("collaborator error: {0}")]
    Collaborator(String),

    #[error("service is shutdown")]
    Shutdown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a rejection with code.
    pub fn rejected(code: RejectionCode, msg: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.code(),
            message: msg.into(),
            http_status: code.http_status(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn collaborator(msg: impl Into<String>) -> Self {
        Self::Collaborator(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Get the HTTP status code for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Rejected { http_status, .. } => *http_status,
            Self::Validation(_) => 400,
            Self::Serialization(_) => 400,
            Self::Transport(_) => 502,
            Self::Storage(_) => 500,
            Self::Collaborator(_) => 503,
            Self::Shutdown => 503,
            Self::Internal(_) => 500,
        }
    }

    /// Get the error code if this is a coded error.
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::Rejected { code, .. } => Some(code),
            Self::Validation(_) | Self::Serialization(_) => {
                Some(RejectionCode::InvalidPayload.code())
            }
            Self::Shutdown => Some(RejectionCode::Shutdown.code()),
            _ => None,
        }
    }

    /// Whether this error is a rejection with the given code.
    pub fn is_rejection(&self, code: RejectionCode) -> bool {
        matches!(self, Self::Rejected { code: c, .. } if *c == code.code())
    }
}
