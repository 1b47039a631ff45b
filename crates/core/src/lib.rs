//! Core types, identifiers, and service seams for the ingestion pipeline.

pub mod automation;
pub mod error;
pub mod events;
pub mod limits;
pub mod partition;
pub mod services;
pub mod website;

pub use automation::*;
pub use error::{Error, RejectionCode, Result};
pub use events::*;
pub use partition::*;
pub use services::*;
pub use website::*;
