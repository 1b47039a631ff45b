//! Action execution.

use async_trait::async_trait;
use engine_core::limits::WEBHOOK_TIMEOUT_SECS;
use engine_core::{Action, EmailAction, Error, Result, TriggerPayload, WebhookAction};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::metrics;
use tracing::{debug, info, warn};

/// Delivers email actions.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &EmailAction, payload: &TriggerPayload) -> Result<()>;
}

/// Mailer that only logs what would be sent.
#[derive(Debug, Default, Clone)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &EmailAction, payload: &TriggerPayload) -> Result<()> {
        info!(
            to = %email.to,
            subject = %email.subject,
            website_id = %payload.website_id,
            event_id = %payload.event_id,
            "Email action"
        );
        Ok(())
    }
}

/// Runs automation actions.
#[derive(Clone)]
pub struct ActionRunner {
    http: reqwest::Client,
    mailer: Arc<dyn Mailer>,
}

impl ActionRunner {
    pub fn new(mailer: Arc<dyn Mailer>) -> Result<Self> {
        Self::with_timeout(mailer, Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
    }

    pub fn with_timeout(mailer: Arc<dyn Mailer>, webhook_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(webhook_timeout)
            .build()
            .map_err(|e| Error::internal(format!("failed to build webhook client: {}", e)))?;
        Ok(Self { http, mailer })
    }

    /// Runs actions in order, stopping at the first failure.
    pub async fn run_all(&self, actions: &[Action], payload: &TriggerPayload) -> Result<()> {
        for (index, action) in actions.iter().enumerate() {
            self.run(action, payload).await.map_err(|e| {
                Error::internal(format!("action {} ({}) failed: {}", index, action.kind(), e))
            })?;
        }
        Ok(())
    }

    pub async fn run(&self, action: &Action, payload: &TriggerPayload) -> Result<()> {
        match action {
            Action::Webhook(webhook) => self.call_webhook(webhook, payload).await,
            Action::Email(email) => self.mailer.send(email, payload).await,
            // Consumed by the tracker script
            Action::Script | Action::Banner => {
                debug!(action = action.kind(), "Client-side action, nothing to do");
                Ok(())
            }
            Action::Invalid { kind, reason } => {
                Err(Error::validation(format!("invalid {} action: {}", kind, reason)))
            }
            Action::Unknown(kind) => {
                warn!(action = %kind, "Unknown action type, treating as no-op");
                Ok(())
            }
        }
    }

    async fn call_webhook(&self, webhook: &WebhookAction, payload: &TriggerPayload) -> Result<()> {
        let method = Method::from_bytes(webhook.method.as_bytes())
            .map_err(|_| Error::validation(format!("invalid HTTP method {}", webhook.method)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &webhook.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::validation(format!("invalid header name {}", name)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| Error::validation(format!("invalid value for header {}", name)))?;
            headers.insert(name, value);
        }

        // Configured keys win over the payload
        let mut body = payload.to_json();
        body.extend(webhook.body.clone());

        let start = Instant::now();
        let response = self
            .http
            .request(method, &webhook.url)
            .headers(headers)
            .json(&Value::Object(body))
            .send()
            .await
            .map_err(|e| Error::transport(format!("webhook request failed: {}", e)))?;
        metrics()
            .webhook_latency_ms
            .observe(start.elapsed().as_millis() as u64);

        let status = response.status();
        if !status.is_success() {
            return Err(Error::transport(format!("webhook returned {}", status)));
        }

        debug!(url = %webhook.url, status = %status, "Webhook delivered");
        Ok(())
    }
}
