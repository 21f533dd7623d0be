//! Rate limit rules: per-endpoint algorithm configuration.
//!
//! Rules are registered with the engine at startup, usually from a YAML file,
//! or passed ad hoc with a single check.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::error::RateLimitError;

/// Tokens added per second when a token bucket does not set a refill rate.
pub const DEFAULT_REFILL_RATE: f64 = 1.0;
/// Units drained per second when a leaky bucket does not set a leak rate.
pub const DEFAULT_LEAK_RATE: f64 = 1.0;
/// Longest window, and longest full refill or drain of a bucket: 365 days.
pub const MAX_WINDOW_MS: u64 = 365 * 24 * 60 * 60 * 1000;

/// The rate limiting algorithm applied to an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Counter per aligned window
    FixedWindow,
    /// Log of request timestamps over a trailing window
    SlidingWindow,
    /// Bucket of tokens refilled at a constant rate
    TokenBucket,
    /// Bucket that fills per request and drains at a constant rate
    LeakyBucket,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
        };
        f.write_str(name)
    }
}

/// Configuration of a single rate limit.
///
/// `window_size_ms` and `max_requests` are required for every algorithm. The
/// bucket algorithms read `bucket_size` (default `max_requests`) and their
/// own rate; the window size then only sets `reset_time` and key expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub algorithm: Algorithm,

    /// Size of the time window or bucket period, in milliseconds
    pub window_size_ms: u64,

    /// Capacity ceiling
    pub max_requests: u64,

    /// Reserved; no algorithm reads it yet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_limit: Option<u64>,

    /// Tokens added per second (token bucket)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refill_rate: Option<f64>,

    /// Capacity override (token and leaky bucket)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_size: Option<u64>,

    /// Units drained per second (leaky bucket)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leak_rate: Option<f64>,
}

impl RateLimitConfig {
    pub fn new(algorithm: Algorithm, window_size_ms: u64, max_requests: u64) -> Self {
        Self {
            algorithm,
            window_size_ms,
            max_requests,
            burst_limit: None,
            refill_rate: None,
            bucket_size: None,
            leak_rate: None,
        }
    }

    pub fn fixed_window(window_size_ms: u64, max_requests: u64) -> Self {
        Self::new(Algorithm::FixedWindow, window_size_ms, max_requests)
    }

    pub fn sliding_window(window_size_ms: u64, max_requests: u64) -> Self {
        Self::new(Algorithm::SlidingWindow, window_size_ms, max_requests)
    }

    pub fn token_bucket(window_size_ms: u64, max_requests: u64) -> Self {
        Self::new(Algorithm::TokenBucket, window_size_ms, max_requests)
    }

    pub fn leaky_bucket(window_size_ms: u64, max_requests: u64) -> Self {
        Self::new(Algorithm::LeakyBucket, window_size_ms, max_requests)
    }

    pub fn with_refill_rate(mut self, per_second: f64) -> Self {
        self.refill_rate = Some(per_second);
        self
    }

    pub fn with_leak_rate(mut self, per_second: f64) -> Self {
        self.leak_rate = Some(per_second);
        self
    }

    pub fn with_bucket_size(mut self, size: u64) -> Self {
        self.bucket_size = Some(size);
        self
    }

    pub fn with_burst_limit(mut self, limit: u64) -> Self {
        self.burst_limit = Some(limit);
        self
    }

    /// Effective bucket capacity.
    pub fn bucket_size(&self) -> u64 {
        self.bucket_size.unwrap_or(self.max_requests)
    }

    /// Effective refill rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate.unwrap_or(DEFAULT_REFILL_RATE)
    }

    /// Effective leak rate in units per second.
    pub fn leak_rate(&self) -> f64 {
        self.leak_rate.unwrap_or(DEFAULT_LEAK_RATE)
    }

    /// Reject configurations no algorithm can run with.
    pub fn validate(&self) -> Result<(), RateLimitError> {
        if self.window_size_ms == 0 {
            return Err(RateLimitError::Validation(
                "window_size_ms must be greater than 0".to_string(),
            ));
        }
        if self.window_size_ms > MAX_WINDOW_MS {
            return Err(RateLimitError::Validation(format!(
                "window_size_ms must be at most {}, got {}",
                MAX_WINDOW_MS, self.window_size_ms
            )));
        }
        if self.max_requests == 0 {
            return Err(RateLimitError::Validation(
                "max_requests must be greater than 0".to_string(),
            ));
        }
        if self.burst_limit == Some(0) {
            return Err(RateLimitError::Validation(
                "burst_limit must be greater than 0".to_string(),
            ));
        }
        if self.bucket_size == Some(0) {
            return Err(RateLimitError::Validation(
                "bucket_size must be greater than 0".to_string(),
            ));
        }
        for (name, rate) in [("refill_rate", self.refill_rate), ("leak_rate", self.leak_rate)] {
            if let Some(rate) = rate {
                if !rate.is_finite() || rate <= 0.0 {
                    return Err(RateLimitError::Validation(format!(
                        "{} must be a positive number, got {}",
                        name, rate
                    )));
                }
            }
        }

        let rate = match self.algorithm {
            Algorithm::TokenBucket => Some(("refill", self.refill_rate())),
            Algorithm::LeakyBucket => Some(("drain", self.leak_rate())),
            _ => None,
        };
        if let Some((what, rate)) = rate {
            let full_ms = self.bucket_size() as f64 / rate * 1000.0;
            if full_ms > MAX_WINDOW_MS as f64 {
                return Err(RateLimitError::Validation(format!(
                    "a full bucket {} of {} at {}/s exceeds {} ms",
                    what,
                    self.bucket_size(),
                    rate,
                    MAX_WINDOW_MS
                )));
            }
        }
        Ok(())
    }
}

/// A table of endpoint name to rate limit configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointRules {
    #[serde(default)]
    pub endpoints: HashMap<String, RateLimitConfig>,
}

impl EndpointRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RateLimitError> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path).map_err(|e| {
            RateLimitError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, RateLimitError> {
        let rules: EndpointRules = serde_yaml::from_str(yaml).map_err(|e| {
            RateLimitError::Configuration(format!("Failed to parse rate limit rules: {}", e))
        })?;
        Ok(rules)
    }

    pub fn get(&self, endpoint: &str) -> Option<&RateLimitConfig> {
        self.endpoints.get(endpoint)
    }

    /// Add every rule of `other`, replacing rules with the same endpoint name.
    pub fn merge(&mut self, other: EndpointRules) {
        self.endpoints.extend(other.endpoints);
    }
}
