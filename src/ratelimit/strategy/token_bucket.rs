//! Token bucket: tokens refill at a constant rate, each request takes one.
//!
//! Refill only counts whole tokens, and `lastRefill` moves to `now` on every
//! check, admitted or not. Checks spaced closer than one token's refill time
//! therefore never earn a token.

use super::{accrued, duration_ms, read_bucket, ttl_secs, update_bucket, BucketFields, BucketState};
use crate::ratelimit::result::RateLimitResult;
use crate::ratelimit::rules::RateLimitConfig;
use crate::store::{RateLimitStore, StoreError};

const FIELDS: BucketFields = BucketFields {
    level: "tokens",
    updated_at: "lastRefill",
};

/// Tokens available at `now`; a bucket with no state starts full.
fn refill(state: Option<BucketState>, config: &RateLimitConfig, now: i64) -> u64 {
    let capacity = config.bucket_size();
    match state {
        None => capacity,
        Some(s) => {
            let added = accrued(now - s.updated_at, config.refill_rate());
            capacity.min(s.level.saturating_add(added))
        }
    }
}

fn result(tokens: u64, admitted: bool, config: &RateLimitConfig, now: i64) -> RateLimitResult {
    RateLimitResult::new(
        admitted,
        tokens,
        config.bucket_size().saturating_sub(tokens),
        now,
        now + config.window_size_ms as i64,
        now,
    )
}

/// Long enough that an expired bucket would have refilled completely anyway.
fn expiry_secs(config: &RateLimitConfig) -> u64 {
    let full = duration_ms(config.bucket_size(), config.refill_rate());
    ttl_secs(config.window_size_ms.max(full))
}

pub(super) async fn check(
    store: &dyn RateLimitStore,
    key: &str,
    config: &RateLimitConfig,
    now: i64,
) -> Result<RateLimitResult, StoreError> {
    update_bucket(store, key, FIELDS, expiry_secs(config), |state| {
        let mut tokens = refill(state, config, now);
        let admitted = tokens > 0;
        if admitted {
            tokens -= 1;
        }
        let next = BucketState {
            level: tokens,
            updated_at: now,
        };
        (next, result(tokens, admitted, config, now))
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
    let tokens = refill(state, config, now);
    Ok(result(tokens, tokens > 0, config, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Command, MemoryStore, Reply};

    #[tokio::test]
    async fn test_new_bucket_starts_full() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::token_bucket(60_000, 5);

        let result = check(&store, "k", &config, 0).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 4);
        assert_eq!(result.total_hits, 1);
        assert_eq!(result.reset_time, 60_000);
    }

    #[tokio::test]
    async fn test_state_is_persisted_even_when_denied() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::token_bucket(1000, 1);

        check(&store, "k", &config, 0).await.unwrap();
        let denied = check(&store, "k", &config, 700).await.unwrap();
        assert!(!denied.allowed);

        let reply = store
            .execute_one(Command::HashGetMulti {
                key: "k".to_string(),
                fields: vec!["tokens".to_string(), "lastRefill".to_string()],
            })
            .await
            .unwrap();
        assert_eq!(
            reply,
            Reply::Values(vec![Some("0".to_string()), Some("700".to_string())])
        );

        // 700ms + 700ms of refill never adds up to a token
        let denied = check(&store, "k", &config, 1400).await.unwrap();
        assert!(!denied.allowed);
    }

    #[tokio::test]
    async fn test_refill_is_capped_at_bucket_size() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::token_bucket(1000, 3).with_refill_rate(10.0);

        for _ in 0..3 {
            check(&store, "k", &config, 0).await.unwrap();
        }
        let result = check(&store, "k", &config, 60_000).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 2);
    }

    #[tokio::test]
    async fn test_bucket_size_overrides_max_requests() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::token_bucket(1000, 100).with_bucket_size(2);

        assert!(check(&store, "k", &config, 0).await.unwrap().allowed);
        assert!(check(&store, "k", &config, 0).await.unwrap().allowed);
        assert!(!check(&store, "k", &config, 0).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_peek_reports_refilled_tokens_without_consuming() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::token_bucket(1000, 2);

        check(&store, "k", &config, 0).await.unwrap();
        check(&store, "k", &config, 0).await.unwrap();

        let status = peek(&store, "k", &config, 0).await.unwrap();
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);

        let status = peek(&store, "k", &config, 1000).await.unwrap();
        assert!(status.allowed);
        assert_eq!(status.remaining, 1);

        // Peeking did not move lastRefill, so the check sees the same refill
        let result = check(&store, "k", &config, 1000).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[test]
    fn test_expiry_covers_full_refill() {
        let config = RateLimitConfig::token_bucket(1000, 10).with_refill_rate(0.5);
        assert_eq!(expiry_secs(&config), 20);

        let config = RateLimitConfig::token_bucket(60_000, 5);
        assert_eq!(expiry_secs(&config), 60);
    }
}
