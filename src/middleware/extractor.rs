//! Identifier extraction: who a request is rate limited as.

use http::header::HeaderName;
use http::request::Parts;
use std::net::SocketAddr;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Identifier used when a request carries nothing to identify it by.
pub const UNKNOWN_IDENTIFIER: &str = "unknown";

/// Picks the identifier a request is counted against.
pub trait IdentifierExtractor: Send + Sync {
    fn extract(&self, request: &Parts) -> String;
}

impl<F> IdentifierExtractor for F
where
    F: Fn(&Parts) -> String + Send + Sync,
{
    fn extract(&self, request: &Parts) -> String {
        self(request)
    }
}

/// Identifies requests by source IP.
///
/// Uses the peer address the server stored as a `SocketAddr` extension, then
/// the first `X-Forwarded-For` hop. Only trust the header behind a proxy that
/// overwrites it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceIp;

impl IdentifierExtractor for SourceIp {
    fn extract(&self, request: &Parts) -> String {
        if let Some(addr) = request.extensions.get::<SocketAddr>() {
            return addr.ip().to_string();
        }

        request
            .headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| UNKNOWN_IDENTIFIER.to_string())
    }
}

/// Identifies requests by the value of a header such as an API key, falling
/// back to [`SourceIp`] when the header is missing.
#[derive(Debug, Clone)]
pub struct HeaderValueOrIp {
    name: HeaderName,
}

impl HeaderValueOrIp {
    pub fn new(name: HeaderName) -> Self {
        Self { name }
    }
}

impl IdentifierExtractor for HeaderValueOrIp {
    fn extract(&self, request: &Parts) -> String {
        match request.headers.get(&self.name).and_then(|v| v.to_str().ok()) {
            Some(value) if !value.is_empty() => value.to_string(),
            _ => SourceIp.extract(request),
        }
    }
}
