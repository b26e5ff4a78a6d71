//! Per-request transport metadata shared by the logger and the enrichment layer.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::ConnectInfo;
use http::header::{HOST, USER_AGENT};
use http::{Extensions, HeaderMap, HeaderName, Request};
use opentelemetry::trace::SpanContext;

/// Facts captured by the request logger and handed down via request extensions.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
    pub started_at: Instant,
    pub ip: String,
    pub user_agent: String,
    pub trace: SpanContext,
    pub logger: tracing::Span,
}

/// Caller-supplied id from `header` when present and non-empty, else a fresh UUID v4.
#[must_use]
pub fn resolve_request_id(headers: &HeaderMap, header: &HeaderName) -> String {
    headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string)
}

/// Client address from the proxy `header`, else the connection peer address.
#[must_use]
pub fn resolve_real_ip<B>(req: &Request<B>, header: &HeaderName) -> String {
    if let Some(ip) = req
        .headers()
        .get(header)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return ip.to_string();
    }
    peer_addr(req.extensions())
}

/// Connection peer as `ip:port`, `"unknown"` when the server did not record it.
#[must_use]
pub fn peer_addr(extensions: &Extensions) -> String {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |ConnectInfo(addr)| addr.to_string())
}

#[must_use]
pub fn user_agent(headers: &HeaderMap) -> String {
    header_str(headers, &USER_AGENT).to_string()
}

/// `Host` header, falling back to the URI authority.
#[must_use]
pub fn host<B>(req: &Request<B>) -> String {
    let from_header = header_str(req.headers(), &HOST);
    if !from_header.is_empty() {
        return from_header.to_string();
    }
    req.uri()
        .authority()
        .map(ToString::to_string)
        .unwrap_or_default()
}

/// First value of every header, keyed by lowercase name.
#[must_use]
pub fn first_values(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .keys()
        .filter_map(|name| {
            let value = headers.get(name)?.to_str().ok()?;
            Some((name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn header_str<'h>(headers: &'h HeaderMap, name: &HeaderName) -> &'h str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}
