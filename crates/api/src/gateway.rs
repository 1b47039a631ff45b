//! Event ingestion gateway.
//!
//! Admission (website, origin, entitlement) happens before anything is
//! published, so a rejected request has no side effects. Persistence is
//! asynchronous and never awaited here.

use chrono::Utc;
use engine_core::limits::MAX_BATCH_EVENTS;
use engine_core::{
    BatchEventRequest, BatchEventResponse, BillingService, Error, EventInput, PublicSiteId,
    RejectionCode, Result, TrackEventResponse, TrackedEvent, Website, WebsiteDirectory,
};
use redpanda::EventProducer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use telemetry::metrics;
use tracing::{debug, info, warn};
use validator::{Validate, ValidationErrors};
use worker::{Enricher, UsageRecorder};

/// Request facts taken from HTTP headers.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// `Origin` header, falling back to `Referer`
    pub origin: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

pub struct Gateway {
    directory: Arc<dyn WebsiteDirectory>,
    billing: Arc<dyn BillingService>,
    producer: Arc<dyn EventProducer>,
    enricher: Arc<Enricher>,
    usage: UsageRecorder,
    closed: AtomicBool,
}

impl Gateway {
    pub fn new(
        directory: Arc<dyn WebsiteDirectory>,
        billing: Arc<dyn BillingService>,
        producer: Arc<dyn EventProducer>,
        enricher: Arc<Enricher>,
        usage: UsageRecorder,
    ) -> Self {
        Self {
            directory,
            billing,
            producer,
            enricher,
            usage,
            closed: AtomicBool::new(false),
        }
    }

    /// Stops intake; every later call fails with [`Error::Shutdown`].
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Gateway intake closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Admits, enriches and publishes one event. All or nothing.
    pub async fn track_event(
        &self,
        input: EventInput,
        context: &RequestContext,
    ) -> Result<TrackEventResponse> {
        let start = Instant::now();
        metrics().events_received.inc();

        let result = self.track_event_inner(input, context).await;
        match &result {
            Ok(response) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                metrics().ingest_latency_ms.observe(latency_ms);
                debug!(event_id = %response.event_id, latency_ms = latency_ms, "Event accepted");
            }
            Err(e) => {
                metrics().events_rejected.inc();
                debug!(error = %e, "Event rejected");
            }
        }
        result
    }

    async fn track_event_inner(
        &self,
        input: EventInput,
        context: &RequestContext,
    ) -> Result<TrackEventResponse> {
        self.ensure_open()?;
        input.validate().map_err(validation_rejection)?;
        input.check_timestamp(Utc::now())?;

        let website = self.admit(&input.website_id, context.origin.as_deref()).await?;
        let event = self.prepare(input, &website, context).await;

        self.publish(&event).await?;
        self.usage.record(&website.owner_tenant, 1);

        Ok(TrackEventResponse::accepted(&event))
    }

    /// Admits a batch once, then publishes each event independently.
    ///
    /// Only published events count as accepted; per-event failures are
    /// logged and skipped.
    pub async fn track_batch(
        &self,
        request: BatchEventRequest,
        context: &RequestContext,
    ) -> Result<BatchEventResponse> {
        let start = Instant::now();
        metrics().batches_received.inc();
        metrics().events_received.inc_by(request.events.len() as u64);

        let result = self.track_batch_inner(request, context).await;
        match &result {
            Ok(response) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                metrics().ingest_latency_ms.observe(latency_ms);
                info!(
                    accepted = response.events_count,
                    latency_ms = latency_ms,
                    "Batch processed"
                );
            }
            Err(e) => {
                debug!(error = %e, "Batch rejected");
            }
        }
        result
    }

    async fn track_batch_inner(
        &self,
        request: BatchEventRequest,
        context: &RequestContext,
    ) -> Result<BatchEventResponse> {
        let total = request.events.len();
        let reject_all = |e: Error| {
            metrics().events_rejected.inc_by(total as u64);
            e
        };

        self.ensure_open().map_err(reject_all)?;
        if total == 0 {
            return Err(reject_all(Error::rejected(
                RejectionCode::InvalidPayload,
                "batch contains no events",
            )));
        }
        if total > MAX_BATCH_EVENTS {
            return Err(reject_all(Error::rejected(
                RejectionCode::BatchTooLarge,
                format!("batch has {} events, exceeds {} limit", total, MAX_BATCH_EVENTS),
            )));
        }

        // Header origin first; otherwise the first event's referrer stands
        // in for the whole batch
        let origin = context
            .origin
            .clone()
            .or_else(|| request.events.first().and_then(|e| e.referrer.clone()));
        let website = self
            .admit(&request.site_id, origin.as_deref())
            .await
            .map_err(reject_all)?;

        let received_at = Utc::now();
        let mut accepted = 0;
        for (index, input) in request.events.into_iter().enumerate() {
            let checked = input
                .validate()
                .map_err(validation_rejection)
                .and_then(|()| input.check_timestamp(received_at));
            if let Err(e) = checked {
                metrics().events_rejected.inc();
                warn!(
                    website_id = %website.canonical_id,
                    index = index,
                    error = %e,
                    "Skipping invalid batch event"
                );
                continue;
            }

            let event = self.prepare(input, &website, context).await;
            match self.publish(&event).await {
                Ok(()) => {
                    accepted += 1;
                    self.usage.record(&website.owner_tenant, 1);
                }
                Err(_) => {
                    metrics().events_rejected.inc();
                }
            }
        }

        if accepted < total {
            warn!(
                website_id = %website.canonical_id,
                accepted = accepted,
                total = total,
                "Batch partially accepted"
            );
        }
        Ok(BatchEventResponse::accepted(accepted))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    /// Website resolution, origin check and entitlement, in that order.
    async fn admit(&self, public_id: &str, origin: Option<&str>) -> Result<Website> {
        let public_id = PublicSiteId::parse(public_id)?;
        let website = self.directory.resolve_website(public_id.as_str()).await?;

        if !website.is_active {
            return Err(Error::rejected(
                RejectionCode::InactiveWebsite,
                format!("website {} is not active", public_id.as_str()),
            ));
        }

        if !self
            .directory
            .validate_origin(origin, &website.registered_domain)
        {
            warn!(
                website_id = %website.canonical_id,
                origin = origin.unwrap_or_default(),
                "Origin does not match registered domain"
            );
            return Err(Error::rejected(
                RejectionCode::OriginMismatch,
                "origin does not match the registered domain",
            ));
        }

        match self.billing.can_record_event(&website.owner_tenant).await {
            Ok(true) => Ok(website),
            Ok(false) => Err(Error::rejected(
                RejectionCode::QuotaExceeded,
                "event quota exceeded",
            )),
            Err(e) => {
                warn!(
                    tenant_id = %website.owner_tenant,
                    error = %e,
                    "Entitlement check failed"
                );
                Err(Error::rejected(
                    RejectionCode::EntitlementUnavailable,
                    "entitlement check unavailable",
                ))
            }
        }
    }

    /// Canonicalizes and enriches one admitted input.
    async fn prepare(
        &self,
        mut input: EventInput,
        website: &Website,
        context: &RequestContext,
    ) -> TrackedEvent {
        if input.user_agent.is_none() {
            input.user_agent = context.user_agent.clone();
        }
        if input.ip.is_none() {
            input.ip = context.client_ip.clone();
        }

        let mut event = TrackedEvent::from_input(input, &website.canonical_id, Utc::now());
        self.enricher.enrich(&mut event).await;
        event
    }

    async fn publish(&self, event: &TrackedEvent) -> Result<()> {
        self.producer.publish(event).await.map_err(|e| {
            Error::rejected(
                RejectionCode::PublishFailed,
                format!("failed to publish event: {}", e),
            )
        })
    }
}

fn validation_rejection(errors: ValidationErrors) -> Error {
    let code = if errors.field_errors().contains_key("properties") {
        RejectionCode::PropertiesTooLarge
    } else {
        RejectionCode::InvalidPayload
    };
    Error::rejected(code, errors.to_string())
}
