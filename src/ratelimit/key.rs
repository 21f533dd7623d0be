//! Rate limit key generation.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Namespace prefixed to every key the default generator produces.
pub const DEFAULT_NAMESPACE: &str = "ratelimit";

/// The subject of a rate limit: who is calling, and which endpoint.
///
/// The identifier is chosen by the caller (IP address, user ID, API key) and
/// the endpoint is a logical route name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitKey {
    pub identifier: String,
    pub endpoint: String,
}

impl RateLimitKey {
    pub fn new(identifier: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            endpoint: endpoint.into(),
        }
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.endpoint, self.identifier)
    }
}

/// Maps a `(identifier, endpoint)` pair to a store key.
///
/// Implementations must be deterministic, and distinct pairs must map to
/// distinct keys. Every key must match [`key_pattern`](KeyGenerator::key_pattern),
/// which stats and cleanup use to find the limiter's keys.
///
/// Fixed window counters live under `{key}:{windowStart}`, and a reset
/// removes every key starting with `{key}:`. No generated key may extend
/// another one that way.
pub trait KeyGenerator: Send + Sync {
    fn generate_key(&self, identifier: &str, endpoint: &str) -> String;

    /// A `KEYS`-style glob matching every generated key.
    fn key_pattern(&self) -> String;
}

/// Generates `{namespace}:{endpoint}:{identifier}`.
///
/// `%` and `:` inside the endpoint and identifier are percent-encoded, so
/// names containing colons (IPv6 addresses, versioned routes) cannot collide.
#[derive(Debug, Clone)]
pub struct DefaultKeyGenerator {
    namespace: String,
}

impl DefaultKeyGenerator {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl Default for DefaultKeyGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl KeyGenerator for DefaultKeyGenerator {
    fn generate_key(&self, identifier: &str, endpoint: &str) -> String {
        format!(
            "{}:{}:{}",
            self.namespace,
            encode_segment(endpoint),
            encode_segment(identifier)
        )
    }

    fn key_pattern(&self) -> String {
        format!("{}:*", escape_glob(&self.namespace))
    }
}

fn encode_segment(segment: &str) -> Cow<'_, str> {
    if !segment.contains(&['%', ':'][..]) {
        return Cow::Borrowed(segment);
    }
    Cow::Owned(segment.replace('%', "%25").replace(':', "%3A"))
}

/// Escape glob metacharacters so `text` only matches itself.
pub fn escape_glob(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
