//! Redpanda adapter: event publishing and acknowledged pull consumption.

pub mod config;
pub mod connection;
pub mod consumer;
pub mod health;
pub mod partitioner;
pub mod producer;

pub use config::*;
pub use consumer::*;
pub use producer::*;
