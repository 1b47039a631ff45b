//! Event enrichment: user agent parsing and IP geolocation.
//!
//! Only absent fields are filled; values the tracker already sent win.

use async_trait::async_trait;
use engine_core::{Error, Result, TrackedEvent};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use woothee::parser::Parser;

const GEO_CACHE_TTL: Duration = Duration::from_secs(3600);
const GEO_CACHE_MAX_CAPACITY: u64 = 50_000;

/// Location resolved for an IP address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoInfo {
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub continent: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

/// IP to location lookup.
#[async_trait]
pub trait GeoLookup: Send + Sync {
    /// `Ok(None)` when the address is not known.
    async fn lookup(&self, ip: IpAddr) -> Result<Option<GeoInfo>>;
}

/// Geolocation disabled.
pub struct NoGeoLookup;

#[async_trait]
impl GeoLookup for NoGeoLookup {
    async fn lookup(&self, _ip: IpAddr) -> Result<Option<GeoInfo>> {
        Ok(None)
    }
}

/// Looks addresses up at `GET {base_url}/{ip}`, caching answers.
pub struct HttpGeoLookup {
    base_url: String,
    http_client: reqwest::Client,
    cache: Cache<IpAddr, Option<GeoInfo>>,
}

impl HttpGeoLookup {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| Error::internal(format!("failed to build geo client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
            cache: Cache::builder()
                .max_capacity(GEO_CACHE_MAX_CAPACITY)
                .time_to_live(GEO_CACHE_TTL)
                .build(),
        })
    }

    async fn remote_lookup(&self, ip: IpAddr) -> Result<Option<GeoInfo>> {
        let url = format!("{}/{}", self.base_url, ip);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::collaborator(format!("geo lookup failed: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::collaborator(format!(
                "geo lookup returned {}",
                response.status()
            )));
        }

        let info: GeoInfo = response
            .json()
            .await
            .map_err(|e| Error::collaborator(format!("invalid geo response: {}", e)))?;
        Ok(Some(info))
    }
}

#[async_trait]
impl GeoLookup for HttpGeoLookup {
    async fn lookup(&self, ip: IpAddr) -> Result<Option<GeoInfo>> {
        if let Some(cached) = self.cache.get(&ip).await {
            return Ok(cached);
        }

        let info = self.remote_lookup(ip).await?;
        self.cache.insert(ip, info.clone()).await;
        Ok(info)
    }
}

/// Whether an address can be meaningfully geolocated.
fn is_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation())
        }
        IpAddr::V6(v6) => {
            let unique_local = (v6.segments()[0] & 0xfe00) == 0xfc00;
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
        }
    }
}

/// Fills derived fields on canonical events.
///
/// Uses woothee for UA parsing; geolocation goes through a [`GeoLookup`].
pub struct Enricher {
    parser: Parser,
    geo: Arc<dyn GeoLookup>,
}

impl Enricher {
    pub fn new(geo: Arc<dyn GeoLookup>) -> Self {
        Self {
            parser: Parser::new(),
            geo,
        }
    }

    /// Enricher with geolocation disabled.
    pub fn without_geo() -> Self {
        Self::new(Arc::new(NoGeoLookup))
    }

    /// Enriches one event. Lookup failures leave fields unset.
    pub async fn enrich(&self, event: &mut TrackedEvent) {
        self.enrich_user_agent(event);
        self.enrich_location(event).await;
    }

    pub fn enrich_user_agent(&self, event: &mut TrackedEvent) {
        let Some(user_agent) = event.user_agent.as_deref() else {
            return;
        };
        let Some(result) = self.parser.parse(user_agent) else {
            return;
        };

        let known = |value: &str| !value.is_empty() && value != "UNKNOWN";

        if event.browser.is_none() && known(result.name) {
            event.browser = Some(result.name.to_string());
            if event.browser_version.is_none() && known(result.version) {
                event.browser_version = Some(result.version.to_string());
            }
        }
        if event.os.is_none() && known(result.os) {
            event.os = Some(result.os.to_string());
        }

        // woothee categories: pc, smartphone, mobilephone, crawler, appliance, misc
        if event.device_type.is_none() {
            let device_type = match result.category {
                "pc" => Some("desktop"),
                "smartphone" | "mobilephone" => Some("mobile"),
                "crawler" => Some("bot"),
                "appliance" => Some("other"),
                _ => None,
            };
            event.device_type = device_type.map(str::to_string);
        }
    }

    /// Fills each missing geo field on its own; tracker values win.
    async fn enrich_location(&self, event: &mut TrackedEvent) {
        let complete = event.country.is_some()
            && event.city.is_some()
            && event.continent.is_some()
            && event.latitude.is_some()
            && event.longitude.is_some();
        if complete {
            return;
        }
        let Some(ip) = event.ip.as_deref().and_then(|ip| ip.trim().parse::<IpAddr>().ok()) else {
            return;
        };
        if !is_public(&ip) {
            debug!(ip = %ip, "Skipping geolocation for non-public address");
            return;
        }

        match self.geo.lookup(ip).await {
            Ok(Some(info)) => {
                event.country = event.country.take().or(info.country);
                event.city = event.city.take().or(info.city);
                event.continent = event.continent.take().or(info.continent);
                event.latitude = event.latitude.or(info.latitude);
                event.longitude = event.longitude.or(info.longitude);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(website_id = %event.website_id, error = %e, "Geolocation failed");
            }
        }
    }
}
