//! HTTP client for the platform service.
//!
//! The platform owns websites, tenants, billing and automation rules. This
//! client implements the directory, billing and automation-source seams
//! over its internal API. Website lookups are cached for 30 seconds.

use async_trait::async_trait;
use engine_core::{
    Automation, AutomationSource, BillingService, Error, RejectionCode, ResourceKind, Result,
    Website, WebsiteDirectory,
};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use telemetry::health;
use tracing::{debug, warn};

/// Cache TTL for website lookups (30 seconds).
const WEBSITE_CACHE_TTL: Duration = Duration::from_secs(30);

/// Maximum cache entries.
const WEBSITE_CACHE_MAX_CAPACITY: u64 = 10_000;

#[derive(Debug, Deserialize)]
struct EntitlementResponse {
    allowed: bool,
}

#[derive(Debug, Serialize)]
struct UsageIncrement<'a> {
    resource: &'a str,
    count: u64,
}

/// Platform service client.
///
/// [`PlatformClient::mock`] builds an in-process stand-in that accepts every
/// well-formed website id and entitles every tenant. It is never chosen
/// implicitly.
#[derive(Clone, Debug)]
pub struct PlatformClient {
    base_url: String,
    http_client: reqwest::Client,
    /// Public id -> resolved website
    websites: Cache<String, Website>,
    mock_mode: bool,
}

impl PlatformClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(Error::internal("platform base URL is empty"));
        }
        Self::build(base_url, false)
    }

    /// In-process stand-in for local development.
    pub fn mock() -> Result<Self> {
        Self::build(String::new(), true)
    }

    fn build(base_url: String, mock_mode: bool) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::internal(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            http_client,
            websites: Cache::builder()
                .max_capacity(WEBSITE_CACHE_MAX_CAPACITY)
                .time_to_live(WEBSITE_CACHE_TTL)
                .build(),
            mock_mode,
        })
    }

    pub fn is_mock(&self) -> bool {
        self.mock_mode
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Calling platform service");

        self.http_client.get(&url).send().await.map_err(|e| {
            warn!(error = %e, "Platform request failed");
            health().platform.set_unhealthy(e.to_string());
            Error::collaborator(format!("platform unavailable: {}", e))
        })
    }

    async fn expect_success(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_server_error() {
            health().platform.set_unhealthy(format!("platform returned {}", status));
        } else {
            health().platform.set_healthy();
        }
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        warn!(status = %status, body = %body, "Platform returned error");
        Err(Error::collaborator(format!(
            "platform returned {}: {}",
            status, body
        )))
    }

    async fn remote_resolve(&self, public_id: &str) -> Result<Website> {
        let response = self.get(&format!("/internal/websites/{}", public_id)).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            health().platform.set_healthy();
            return Err(Error::rejected(
                RejectionCode::UnknownWebsite,
                format!("unknown website {}", public_id),
            ));
        }

        let response = Self::expect_success(response).await?;
        response
            .json::<Website>()
            .await
            .map_err(|e| Error::collaborator(format!("invalid website response: {}", e)))
    }

    fn mock_website(public_id: &str) -> Website {
        Website {
            canonical_id: public_id.to_string(),
            owner_tenant: format!("tenant-{}", public_id),
            registered_domain: "localhost".to_string(),
            is_active: true,
        }
    }
}

#[async_trait]
impl WebsiteDirectory for PlatformClient {
    async fn resolve_website(&self, public_id: &str) -> Result<Website> {
        if let Some(cached) = self.websites.get(public_id).await {
            return Ok(cached);
        }

        let website = if self.mock_mode {
            Self::mock_website(public_id)
        } else {
            self.remote_resolve(public_id).await?
        };

        self.websites
            .insert(public_id.to_string(), website.clone())
            .await;
        Ok(website)
    }

    fn validate_origin(&self, origin: Option<&str>, registered_domain: &str) -> bool {
        self.mock_mode || engine_core::origin_matches(origin, registered_domain)
    }
}

#[async_trait]
impl BillingService for PlatformClient {
    async fn can_record_event(&self, tenant_id: &str) -> Result<bool> {
        if self.mock_mode {
            return Ok(true);
        }

        let response = self
            .get(&format!(
                "/internal/tenants/{}/entitlements/{}",
                tenant_id,
                ResourceKind::Events.as_str()
            ))
            .await?;
        let response = Self::expect_success(response).await?;
        let entitlement: EntitlementResponse = response
            .json()
            .await
            .map_err(|e| Error::collaborator(format!("invalid entitlement response: {}", e)))?;
        Ok(entitlement.allowed)
    }

    async fn increment_usage(&self, tenant_id: &str, kind: ResourceKind, count: u64) -> Result<()> {
        if self.mock_mode {
            return Ok(());
        }

        let url = format!("{}/internal/tenants/{}/usage", self.base_url, tenant_id);
        let response = self
            .http_client
            .post(&url)
            .json(&UsageIncrement {
                resource: kind.as_str(),
                count,
            })
            .send()
            .await
            .map_err(|e| {
                health().platform.set_unhealthy(e.to_string());
                Error::collaborator(format!("platform unavailable: {}", e))
            })?;
        Self::expect_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl AutomationSource for PlatformClient {
    async fn list_active_automations(&self, website_id: &str) -> Result<Vec<Automation>> {
        if self.mock_mode {
            return Ok(Vec::new());
        }

        let response = self
            .get(&format!("/internal/websites/{}/automations?active=true", website_id))
            .await?;
        let response = Self::expect_success(response).await?;
        response
            .json::<Vec<Automation>>()
            .await
            .map_err(|e| Error::collaborator(format!("invalid automations response: {}", e)))
    }
}
