//! Errors returned by the rate limiter engine.

use thiserror::Error;

use crate::store::StoreError;

/// Errors returned by [`RateLimiter`](super::RateLimiter) operations.
///
/// The engine never turns an error into an allow or deny decision; callers
/// choose between failing open and failing closed.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// No configuration resolved for the endpoint. A registration bug, not
    /// worth retrying.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A configuration was rejected at registration or check time
    #[error("Invalid rate limit configuration: {0}")]
    Validation(String),

    /// The backing store failed; usually transient
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl RateLimitError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RateLimitError::Store(_))
    }
}
