//! API routes.

pub mod health;
pub mod ingest;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use engine_core::limits::{MAX_BATCH_SIZE_BYTES, MAX_EVENT_SIZE_BYTES};
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Creates the API router.
///
/// Body limits sit above the coded size checks in the handlers so that
/// moderately oversized bodies still get a `VALID_00x` response.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/api/events",
            post(ingest::track_event_handler).layer(DefaultBodyLimit::max(2 * MAX_EVENT_SIZE_BYTES)),
        )
        .route(
            "/api/events/batch",
            post(ingest::track_batch_handler).layer(DefaultBodyLimit::max(2 * MAX_BATCH_SIZE_BYTES)),
        )
        .route("/health", get(health::health_handler))
        .route("/health/ready", get(health::ready_handler))
        .route("/health/live", get(health::live_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(CompressionLayer::new()),
        )
        .with_state(state)
}
