//! Sliding window log: one sorted-set entry per request, scored by time.
//!
//! The request's own entry is added before the admission decision, so a
//! denied request keeps occupying a slot until it ages out of the window.

use uuid::Uuid;

use super::{integer_at, ttl_secs};
use crate::ratelimit::result::RateLimitResult;
use crate::ratelimit::rules::RateLimitConfig;
use crate::store::{Command, RateLimitStore, StoreError};

fn result(count: u64, admitted: bool, config: &RateLimitConfig, now: i64) -> RateLimitResult {
    let window = config.window_size_ms as i64;
    RateLimitResult::new(
        admitted,
        config.max_requests.saturating_sub(count),
        count,
        now - window,
        now + window,
        now,
    )
}

pub(super) async fn check(
    store: &dyn RateLimitStore,
    key: &str,
    config: &RateLimitConfig,
    now: i64,
) -> Result<RateLimitResult, StoreError> {
    let window = config.window_size_ms as i64;
    // Two requests in the same millisecond must not collapse into one member.
    let member = format!("{}-{}", now, Uuid::new_v4().simple());

    let replies = store
        .execute(vec![
            Command::SortedSetRemoveRangeByScore {
                key: key.to_string(),
                min: i64::MIN,
                max: now - window - 1,
            },
            Command::SortedSetAdd {
                key: key.to_string(),
                score: now,
                member,
            },
            Command::SortedSetCardinality {
                key: key.to_string(),
            },
            Command::Expire {
                key: key.to_string(),
                seconds: ttl_secs(config.window_size_ms),
            },
        ])
        .await?;
    let count = integer_at(replies, 2)?;

    Ok(result(count, count <= config.max_requests, config, now))
}

pub(super) async fn peek(
    store: &dyn RateLimitStore,
    key: &str,
    config: &RateLimitConfig,
    now: i64,
) -> Result<RateLimitResult, StoreError> {
    let reply = store
        .execute_one(Command::SortedSetCount {
            key: key.to_string(),
            min: now - config.window_size_ms as i64,
            max: i64::MAX,
        })
        .await?;
    let count = reply.into_integer()?.max(0) as u64;

    Ok(result(count, count < config.max_requests, config, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_same_millisecond_requests_are_counted_separately() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::sliding_window(1000, 10);

        for expected in 1..=3 {
            let result = check(&store, "k", &config, 500).await.unwrap();
            assert_eq!(result.total_hits, expected);
        }
    }

    #[tokio::test]
    async fn test_entries_age_out() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::sliding_window(1000, 2);

        check(&store, "k", &config, 0).await.unwrap();
        check(&store, "k", &config, 600).await.unwrap();

        // The entry at 0 is exactly one window old and still counts
        let result = check(&store, "k", &config, 1000).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.total_hits, 3);

        // At 1001 the entry at 0 has aged out
        let result = check(&store, "k", &config, 1001).await.unwrap();
        assert_eq!(result.total_hits, 3);
        assert_eq!(result.window_start, 1);
        assert_eq!(result.reset_time, 2001);
    }

    #[tokio::test]
    async fn test_denied_requests_occupy_slots() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::sliding_window(1000, 1);

        assert!(check(&store, "k", &config, 0).await.unwrap().allowed);
        assert!(!check(&store, "k", &config, 500).await.unwrap().allowed);

        // The first entry has aged out, but the denied one at 500 has not
        let result = check(&store, "k", &config, 1200).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.total_hits, 2);

        // Once both are gone a request is admitted again
        let result = check(&store, "k", &config, 2300).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.total_hits, 1);
    }

    #[tokio::test]
    async fn test_peek_does_not_add_entries() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::sliding_window(1000, 2);

        check(&store, "k", &config, 0).await.unwrap();
        for _ in 0..5 {
            let status = peek(&store, "k", &config, 100).await.unwrap();
            assert!(status.allowed);
            assert_eq!(status.total_hits, 1);
            assert_eq!(status.remaining, 1);
        }

        let status = peek(&store, "k", &config, 1001).await.unwrap();
        assert_eq!(status.total_hits, 0);
    }
}
