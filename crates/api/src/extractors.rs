//! Request extractors.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};

use crate::gateway::RequestContext;

/// First hop of `X-Forwarded-For`, else `X-Real-IP`.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(xff) = header_str(headers, "X-Forwarded-For") {
        if let Some(ip) = xff.split(',').map(str::trim).find(|ip| !ip.is_empty()) {
            return Some(ip.to_string());
        }
    }

    header_str(headers, "X-Real-IP").map(|ip| ip.trim().to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl header::AsHeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .filter(|v| !v.trim().is_empty())
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        let origin = header_str(headers, header::ORIGIN)
            .filter(|o| *o != "null")
            .or_else(|| header_str(headers, header::REFERER))
            .map(str::to_string);

        Ok(RequestContext {
            origin,
            client_ip: client_ip(headers),
            user_agent: header_str(headers, header::USER_AGENT).map(str::to_string),
        })
    }
}
