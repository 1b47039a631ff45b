//! Standardized API responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use engine_core::RejectionCode;
use serde::{Deserialize, Serialize};
use telemetry::{ComponentHealthReport, HealthStatus};

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub intake_open: bool,
    pub components: Vec<ComponentHealthReport>,
    pub collector_queue_depth: u64,
    pub usage_queue_depth: u64,
    pub automations_in_flight: u64,
}

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// API error: status plus `{error, code}` body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub response: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, code: Option<&str>, msg: impl Into<String>) -> Self {
        Self {
            status,
            response: ErrorResponse {
                error: msg.into(),
                code: code.map(str::to_string),
            },
        }
    }

    pub fn rejected(code: RejectionCode, msg: impl Into<String>) -> Self {
        let status =
            StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::BAD_REQUEST);
        Self::new(status, Some(code.code()), msg)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.response)).into_response()
    }
}

impl From<engine_core::Error> for ApiError {
    fn from(err: engine_core::Error) -> Self {
        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match &err {
            engine_core::Error::Rejected { message, .. } => message.clone(),
            // Internal detail stays in the logs
            engine_core::Error::Storage(_) | engine_core::Error::Internal(_) => {
                "internal error".to_string()
            }
            _ => err.to_string(),
        };
        Self::new(status, err.error_code(), message)
    }
}
