//! Algorithm strategies.
//!
//! Each strategy consumes one unit of capacity for a store key and reports the
//! outcome. Window algorithms do this in a single atomic batch. Bucket
//! algorithms read their hash, compute the next state locally and write it
//! back with a compare-and-set, retrying when another writer got there first.
//!
//! Every strategy also has a read-only `peek` that reports what the current
//! state implies without consuming anything.

mod fixed_window;
mod leaky_bucket;
mod sliding_window;
mod token_bucket;

use tracing::debug;

use super::result::RateLimitResult;
use super::rules::{Algorithm, RateLimitConfig};
use crate::store::{Command, RateLimitStore, Reply, StoreError};

/// Upper bound on compare-and-set attempts for one bucket update.
const MAX_CAS_ATTEMPTS: usize = 32;

impl Algorithm {
    /// Consume one unit of capacity at `key`.
    pub(crate) async fn check(
        self,
        store: &dyn RateLimitStore,
        key: &str,
        config: &RateLimitConfig,
        now: i64,
    ) -> Result<RateLimitResult, StoreError> {
        match self {
            Algorithm::FixedWindow => fixed_window::check(store, key, config, now).await,
            Algorithm::SlidingWindow => sliding_window::check(store, key, config, now).await,
            Algorithm::TokenBucket => token_bucket::check(store, key, config, now).await,
            Algorithm::LeakyBucket => leaky_bucket::check(store, key, config, now).await,
        }
    }

    /// Report the state at `key` without consuming capacity.
    ///
    /// `allowed` tells whether the next check would be admitted.
    pub(crate) async fn peek(
        self,
        store: &dyn RateLimitStore,
        key: &str,
        config: &RateLimitConfig,
        now: i64,
    ) -> Result<RateLimitResult, StoreError> {
        match self {
            Algorithm::FixedWindow => fixed_window::peek(store, key, config, now).await,
            Algorithm::SlidingWindow => sliding_window::peek(store, key, config, now).await,
            Algorithm::TokenBucket => token_bucket::peek(store, key, config, now).await,
            Algorithm::LeakyBucket => leaky_bucket::peek(store, key, config, now).await,
        }
    }

}

/// A glob matching every store key derived from `key`.
pub(crate) fn window_key_pattern(key: &str) -> String {
    fixed_window::window_key_pattern(key)
}

/// Expiry in whole seconds covering `ms`, never zero.
fn ttl_secs(ms: u64) -> u64 {
    ms.div_ceil(1000).max(1)
}

/// Whole units accrued over `elapsed_ms` at `per_second`.
fn accrued(elapsed_ms: i64, per_second: f64) -> u64 {
    if elapsed_ms <= 0 {
        return 0;
    }
    // The epsilon absorbs float error such as 3 * 0.1 landing just under 0.3.
    (elapsed_ms as f64 * per_second / 1000.0 + 1e-9).floor() as u64
}

/// Milliseconds needed to move `units` at `per_second`.
fn duration_ms(units: u64, per_second: f64) -> u64 {
    (units as f64 / per_second * 1000.0).ceil() as u64
}

/// Take the integer reply at `index` of a batch.
fn integer_at(replies: Vec<Reply>, index: usize) -> Result<u64, StoreError> {
    let reply = replies
        .into_iter()
        .nth(index)
        .ok_or(StoreError::UnexpectedReply {
            command: "EXEC",
            reply: format!("missing reply #{}", index),
        })?;
    Ok(reply.into_integer()?.max(0) as u64)
}

/// Persisted bucket state: a level and when it was last brought up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BucketState {
    level: u64,
    updated_at: i64,
}

/// Hash field names a bucket algorithm stores its state under.
#[derive(Debug, Clone, Copy)]
struct BucketFields {
    level: &'static str,
    updated_at: &'static str,
}

impl BucketFields {
    /// Field/value pairs for `state`; an absent state is all empty strings.
    fn encode(&self, state: Option<BucketState>) -> Vec<(String, String)> {
        let (level, updated_at) = match state {
            Some(s) => (s.level.to_string(), s.updated_at.to_string()),
            None => (String::new(), String::new()),
        };
        vec![
            (self.level.to_string(), level),
            (self.updated_at.to_string(), updated_at),
        ]
    }
}

async fn read_bucket(
    store: &dyn RateLimitStore,
    key: &str,
    fields: BucketFields,
) -> Result<Option<BucketState>, StoreError> {
    let values = store
        .execute_one(Command::HashGetMulti {
            key: key.to_string(),
            fields: vec![fields.level.to_string(), fields.updated_at.to_string()],
        })
        .await?
        .into_values()?;

    match values.as_slice() {
        [Some(level), Some(updated_at)] => {
            let level = level.parse().map_err(|_| StoreError::UnexpectedReply {
                command: "HMGET",
                reply: format!("{} = {:?}", fields.level, level),
            })?;
            let updated_at = updated_at.parse().map_err(|_| StoreError::UnexpectedReply {
                command: "HMGET",
                reply: format!("{} = {:?}", fields.updated_at, updated_at),
            })?;
            Ok(Some(BucketState { level, updated_at }))
        }
        [None, None] => Ok(None),
        // A half-written bucket could never match a compare-and-set
        _ => Err(StoreError::UnexpectedReply {
            command: "HMGET",
            reply: format!("{:?} for {} and {}", values, fields.level, fields.updated_at),
        }),
    }
}

/// Apply `transition` to the bucket at `key` atomically.
///
/// The state is re-read and the transition recomputed whenever the
/// compare-and-set finds the hash changed underneath it.
async fn update_bucket<F>(
    store: &dyn RateLimitStore,
    key: &str,
    fields: BucketFields,
    ttl_secs: u64,
    mut transition: F,
) -> Result<RateLimitResult, StoreError>
where
    F: FnMut(Option<BucketState>) -> (BucketState, RateLimitResult) + Send,
{
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let current = read_bucket(store, key, fields).await?;
        let (next, result) = transition(current);

        let expected = fields.encode(current);
        let new = fields.encode(Some(next));
        if store.compare_and_set_hash(key, &expected, &new, ttl_secs).await? {
            return Ok(result);
        }

        debug!(key = %key, attempt = attempt, "Bucket changed concurrently, retrying");
    }

    Err(StoreError::Contention {
        key: key.to_string(),
        attempts: MAX_CAS_ATTEMPTS,
    })
}
