//! Website identity and origin validation.
//!
//! This module provides:
//! - Public website id format validation
//! - The resolved `Website` record returned by the website directory
//! - Origin / referrer matching against a registered domain

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::error::{Error, RejectionCode, Result};
use crate::limits::PUBLIC_SITE_ID_PATTERN;

/// Compiled public id regex (lazy initialization).
static PUBLIC_SITE_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(PUBLIC_SITE_ID_PATTERN).expect("invalid public site id pattern"));

/// A website id as supplied by a tracker, validated for shape only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicSiteId(String);

impl PublicSiteId {
    /// Parse and validate a public website id.
    ///
    /// Format: `[A-Za-z0-9_-]{1,64}`
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::rejected(
                RejectionCode::InvalidPayload,
                "website id is required",
            ));
        }

        if !PUBLIC_SITE_ID_REGEX.is_match(raw) {
            return Err(Error::rejected(
                RejectionCode::UnknownWebsite,
                "invalid website id format",
            ));
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Website as known to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Website {
    /// The single internal id all storage uses
    #[serde(alias = "canonical_id", alias = "id")]
    pub canonical_id: String,
    /// Tenant that owns the site; quota and billing scope
    #[serde(alias = "owner_tenant", alias = "tenantId")]
    pub owner_tenant: String,
    #[serde(alias = "registered_domain", alias = "domain")]
    pub registered_domain: String,
    #[serde(alias = "is_active", alias = "active")]
    pub is_active: bool,
}

/// Extract the host of an origin or URL, lowercased and without `www.`.
pub fn origin_host(origin: &str) -> Option<String> {
    let origin = origin.trim();
    if origin.is_empty() || origin == "null" {
        return None;
    }

    let parsed = url::Url::parse(origin)
        .or_else(|_| url::Url::parse(&format!("https://{}", origin)))
        .ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

/// Check a declared origin against the registered domain.
///
/// An absent origin passes (server-side senders do not declare one). A
/// present origin must equal the domain or be a subdomain of it.
pub fn origin_matches(origin: Option<&str>, registered_domain: &str) -> bool {
    let Some(origin) = origin.filter(|o| !o.trim().is_empty()) else {
        return true;
    };

    let Some(host) = origin_host(origin) else {
        return false;
    };
    let Some(domain) = origin_host(registered_domain) else {
        return false;
    };

    host == domain || host.ends_with(&format!(".{}", domain))
}
