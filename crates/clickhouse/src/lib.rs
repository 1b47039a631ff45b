//! ClickHouse storage for the ingestion pipeline.

pub mod client;
pub mod config;
pub mod events;
pub mod executions;
pub mod health;
pub mod query;
pub mod schema;

pub use client::*;
pub use config::*;
pub use events::*;
pub use executions::*;
pub use query::*;
