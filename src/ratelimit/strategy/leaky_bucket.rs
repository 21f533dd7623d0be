//! Leaky bucket: each request adds one unit, the bucket drains at a constant rate.

use super::{accrued, duration_ms, read_bucket, ttl_secs, update_bucket, BucketFields, BucketState};
use crate::ratelimit::result::RateLimitResult;
use crate::ratelimit::rules::RateLimitConfig;
use crate::store::{RateLimitStore, StoreError};

const FIELDS: BucketFields = BucketFields {
    level: "level",
    updated_at: "lastLeak",
};

/// Level left at `now` after draining; a bucket with no state is empty.
fn drain(state: Option<BucketState>, config: &RateLimitConfig, now: i64) -> u64 {
    match state {
        None => 0,
        Some(s) => s
            .level
            .saturating_sub(accrued(now - s.updated_at, config.leak_rate())),
    }
}

fn result(level: u64, admitted: bool, config: &RateLimitConfig, now: i64) -> RateLimitResult {
    RateLimitResult::new(
        admitted,
        config.bucket_size().saturating_sub(level),
        level,
        now,
        now + config.window_size_ms as i64,
        now,
    )
}

/// Long enough that an expired bucket would have drained completely anyway.
fn expiry_secs(config: &RateLimitConfig) -> u64 {
    let empty = duration_ms(config.bucket_size(), config.leak_rate());
    ttl_secs(config.window_size_ms.max(empty))
}

pub(super) async fn check(
    store: &dyn RateLimitStore,
    key: &str,
    config: &RateLimitConfig,
    now: i64,
) -> Result<RateLimitResult, StoreError> {
    update_bucket(store, key, FIELDS, expiry_secs(config), |state| {
        let mut level = drain(state, config, now);
        let admitted = level < config.bucket_size();
        if admitted {
            level += 1;
        }
        let next = BucketState {
            level,
            updated_at: now,
        };
        (next, result(level, admitted, config, now))
    })
    .await
}

pub(super) async fn peek(
    store: &dyn RateLimitStore,
    key: &str,
    config: &RateLimitConfig,
    now: i64,
) -> Result<RateLimitResult, StoreError> {
    let state = read_bucket(store, key, FIELDS).await?;
    let level = drain(state, config, now);
    Ok(result(level, level < config.bucket_size(), config, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_fills_then_denies() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::leaky_bucket(1000, 3);

        for expected in 1..=3 {
            let result = check(&store, "k", &config, 0).await.unwrap();
            assert!(result.allowed);
            assert_eq!(result.total_hits, expected);
            assert_eq!(result.remaining, 3 - expected);
        }

        let denied = check(&store, "k", &config, 0).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.total_hits, 3);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after, Some(1));
    }

    #[tokio::test]
    async fn test_partial_drain() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::leaky_bucket(1000, 4).with_leak_rate(1.0);

        for _ in 0..4 {
            check(&store, "k", &config, 0).await.unwrap();
        }

        // 2.5s leaks two whole units
        let result = check(&store, "k", &config, 2_500).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.total_hits, 3);
    }

    #[tokio::test]
    async fn test_peek_does_not_fill() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::leaky_bucket(1000, 1);

        for _ in 0..3 {
            let status = peek(&store, "k", &config, 0).await.unwrap();
            assert!(status.allowed);
            assert_eq!(status.total_hits, 0);
        }

        check(&store, "k", &config, 0).await.unwrap();
        let status = peek(&store, "k", &config, 0).await.unwrap();
        assert!(!status.allowed);
        assert_eq!(status.total_hits, 1);
    }

    #[test]
    fn test_expiry_covers_full_drain() {
        let config = RateLimitConfig::leaky_bucket(1000, 30).with_leak_rate(2.0);
        assert_eq!(expiry_secs(&config), 15);
    }
}
