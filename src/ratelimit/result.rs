//! The outcome of a rate limit check.

use serde::{Deserialize, Serialize};

/// The uniform result every algorithm produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    /// Whether the request is admitted
    pub allowed: bool,

    /// Capacity left in the current window or bucket
    pub remaining: u64,

    /// Epoch milliseconds at which the window rolls over or the bucket period ends
    pub reset_time: i64,

    /// Seconds to wait before retrying; only set on denial
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,

    /// Count or level consumed so far
    pub total_hits: u64,

    /// Epoch milliseconds marking the start of the counting interval
    pub window_start: i64,
}

impl RateLimitResult {
    /// Build a result observed at `now`, deriving `retry_after` on denial.
    pub fn new(
        allowed: bool,
        remaining: u64,
        total_hits: u64,
        window_start: i64,
        reset_time: i64,
        now: i64,
    ) -> Self {
        let retry_after = if allowed {
            None
        } else {
            Some(retry_after_secs(reset_time, now))
        };

        Self {
            allowed,
            remaining,
            reset_time,
            retry_after,
            total_hits,
            window_start,
        }
    }

    /// The limit reported to clients: hits consumed plus capacity left.
    pub fn limit(&self) -> u64 {
        self.total_hits.saturating_add(self.remaining)
    }

    /// `reset_time` in epoch seconds, rounded up.
    pub fn reset_time_secs(&self) -> i64 {
        (self.reset_time + 999).div_euclid(1000)
    }
}

/// Whole seconds until `reset_time`, rounded up and never below one.
fn retry_after_secs(reset_time: i64, now: i64) -> u64 {
    let wait_ms = (reset_time - now).max(0) as u64;
    wait_ms.div_ceil(1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_result_has_no_retry_after() {
        let result = RateLimitResult::new(true, 4, 1, 0, 1000, 0);
        assert_eq!(result.retry_after, None);
        assert_eq!(result.limit(), 5);
    }

    #[test]
    fn test_denied_result_rounds_retry_after_up() {
        let result = RateLimitResult::new(false, 0, 4, -59_900, 60_100, 100);
        assert_eq!(result.retry_after, Some(60));

        let result = RateLimitResult::new(false, 0, 3, 0, 1_000, 999);
        assert_eq!(result.retry_after, Some(1));
    }

    #[test]
    fn test_retry_after_is_at_least_one_second() {
        let result = RateLimitResult::new(false, 0, 3, 0, 1_000, 5_000);
        assert_eq!(result.retry_after, Some(1));
    }

    #[test]
    fn test_reset_time_secs() {
        let result = RateLimitResult::new(true, 1, 1, 0, 1_000, 0);
        assert_eq!(result.reset_time_secs(), 1);

        let result = RateLimitResult::new(true, 1, 1, 0, 1_001, 0);
        assert_eq!(result.reset_time_secs(), 2);
    }

    #[test]
    fn test_serializes_camel_case() {
        let result = RateLimitResult::new(false, 0, 3, 0, 2_000, 1_000);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["retryAfter"], 1);
        assert_eq!(json["resetTime"], 2_000);
        assert_eq!(json["totalHits"], 3);
        assert_eq!(json["windowStart"], 0);
    }
}
