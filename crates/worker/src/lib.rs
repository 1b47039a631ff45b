//! Consumer-side pipeline of the ingestion service.
//!
//! - Enrichment (user agent, geolocation) used by the gateway
//! - Partition provisioning and batched writes to storage
//! - Usage accounting channel
//! - Delivery fan-out to storage and automations
//! - Ordered start-up and shutdown

pub mod collector;
pub mod enrichment;
pub mod lifecycle;
pub mod pipeline;
pub mod provisioner;
pub mod usage;

pub use collector::{collector, flush_batch, BatchCollector, CollectorConfig, CollectorHandle, CollectorStats};
pub use enrichment::{Enricher, GeoInfo, GeoLookup, HttpGeoLookup, NoGeoLookup};
pub use lifecycle::{Pipeline, PipelineConfig, PipelineDeps, ShutdownReport};
pub use pipeline::DeliveryHandler;
pub use provisioner::PartitionProvisioner;
pub use usage::{usage_channel, UsageDrainer, UsageRecorder, UsageSignal};
