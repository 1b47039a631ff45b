//! Ingestion endpoint handlers.
//!
//! Bodies are parsed by hand so malformed JSON gets a coded `VALID_001`
//! response instead of the framework's default rejection.

use axum::{body::Bytes, extract::State, Json};
use engine_core::{
    limits::{MAX_BATCH_SIZE_BYTES, MAX_EVENT_SIZE_BYTES},
    BatchEventRequest, BatchEventResponse, EventInput, RejectionCode, TrackEventResponse,
};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::gateway::RequestContext;
use crate::response::ApiError;
use crate::state::AppState;

fn parse_body<T: DeserializeOwned>(body: &[u8], limit: usize, code: RejectionCode) -> Result<T, ApiError> {
    if body.len() > limit {
        return Err(ApiError::rejected(
            code,
            format!(
                "payload size {}KB exceeds {}KB limit",
                body.len() / 1024,
                limit / 1024
            ),
        ));
    }

    serde_json::from_slice(body).map_err(|e| {
        debug!(error = %e, "Malformed ingestion payload");
        ApiError::rejected(RejectionCode::InvalidPayload, format!("invalid JSON: {}", e))
    })
}

/// POST /api/events - One event.
pub async fn track_event_handler(
    State(state): State<AppState>,
    context: RequestContext,
    body: Bytes,
) -> Result<Json<TrackEventResponse>, ApiError> {
    let input: EventInput = parse_body(&body, MAX_EVENT_SIZE_BYTES, RejectionCode::InvalidPayload)?;
    let response = state.gateway.track_event(input, &context).await?;
    Ok(Json(response))
}

/// POST /api/events/batch - `{siteID, events: [...]}`.
pub async fn track_batch_handler(
    State(state): State<AppState>,
    context: RequestContext,
    body: Bytes,
) -> Result<Json<BatchEventResponse>, ApiError> {
    let request: BatchEventRequest =
        parse_body(&body, MAX_BATCH_SIZE_BYTES, RejectionCode::BatchTooLarge)?;
    let response = state.gateway.track_batch(request, &context).await?;
    Ok(Json(response))
}
