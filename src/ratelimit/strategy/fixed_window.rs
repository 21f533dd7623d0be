//! Fixed window: one counter per aligned window.
//!
//! A burst straddling a window boundary can admit up to twice `max_requests`
//! in a short span. That is inherent to the algorithm.

use super::{integer_at, ttl_secs};
use crate::ratelimit::key::escape_glob;
use crate::ratelimit::result::RateLimitResult;
use crate::ratelimit::rules::RateLimitConfig;
use crate::store::{Command, RateLimitStore, StoreError};

/// Start of the window containing `now`.
pub(super) fn window_start(now: i64, window_size_ms: u64) -> i64 {
    let window = window_size_ms as i64;
    now.div_euclid(window) * window
}

/// Store key of the counter for the window starting at `start`.
pub(super) fn window_key(key: &str, start: i64) -> String {
    format!("{}:{}", key, start)
}

/// A glob matching the counters of every window of `key`.
pub(super) fn window_key_pattern(key: &str) -> String {
    format!("{}:*", escape_glob(key))
}

fn result(count: u64, admitted: bool, start: i64, config: &RateLimitConfig, now: i64) -> RateLimitResult {
    RateLimitResult::new(
        admitted,
        config.max_requests.saturating_sub(count),
        count,
        start,
        start + config.window_size_ms as i64,
        now,
    )
}

pub(super) async fn check(
    store: &dyn RateLimitStore,
    key: &str,
    config: &RateLimitConfig,
    now: i64,
) -> Result<RateLimitResult, StoreError> {
    let start = window_start(now, config.window_size_ms);
    let counter = window_key(key, start);

    let replies = store
        .execute(vec![
            Command::Increment {
                key: counter.clone(),
            },
            Command::Expire {
                key: counter,
                seconds: ttl_secs(config.window_size_ms),
            },
        ])
        .await?;
    let count = integer_at(replies, 0)?;

    Ok(result(count, count <= config.max_requests, start, config, now))
}

pub(super) async fn peek(
    store: &dyn RateLimitStore,
    key: &str,
    config: &RateLimitConfig,
    now: i64,
) -> Result<RateLimitResult, StoreError> {
    let start = window_start(now, config.window_size_ms);
    let value = store
        .execute_one(Command::Get {
            key: window_key(key, start),
        })
        .await?
        .into_value()?;

    let count = match value {
        Some(v) => v.parse().map_err(|_| StoreError::UnexpectedReply {
            command: "GET",
            reply: v,
        })?,
        None => 0,
    };

    Ok(result(count, count < config.max_requests, start, config, now))
}
