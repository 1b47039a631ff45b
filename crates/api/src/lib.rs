//! HTTP surface of the ingestion service.
//!
//! - [`gateway::Gateway`]: admission, enrichment and broker hand-off
//! - [`platform::PlatformClient`]: websites, billing and automation rules
//! - [`routes::router`]: ingestion and health endpoints

pub mod extractors;
pub mod gateway;
pub mod platform;
pub mod response;
pub mod routes;
pub mod state;

pub use gateway::{Gateway, RequestContext};
pub use platform::PlatformClient;
pub use routes::router;
pub use state::AppState;
