//! Shared store adapters.
//!
//! The rate limiter keeps no counts in process. Every counter, sorted-set log
//! and bucket hash lives in a store reachable by all limiter instances. This
//! module defines the primitive command set the algorithms need, the
//! [`RateLimitStore`] trait that executes those commands atomically, and two
//! adapters: [`RedisStore`] for production and [`MemoryStore`] for tests and
//! single-process deployments.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::{RedisConfig, RedisStore};

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised while talking to the backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Network, protocol or server-side failure reported by the Redis client
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store answered with a reply the command cannot produce
    #[error("Unexpected reply to {command}: {reply}")]
    UnexpectedReply {
        command: &'static str,
        reply: String,
    },

    /// The key holds a value of a different type than the command expects
    #[error("WRONGTYPE operation against key {0} holding the wrong kind of value")]
    WrongType(String),

    /// An optimistic update kept losing races against concurrent writers
    #[error("Gave up updating {key} after {attempts} conflicting writes")]
    Contention { key: String, attempts: usize },

    /// The store has been closed
    #[error("Store connection is closed")]
    Closed,
}

/// A primitive store command.
///
/// Scores are epoch milliseconds. `i64::MIN` and `i64::MAX` stand for the
/// open bounds `-inf` and `+inf` in range commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `INCR key`
    Increment { key: String },
    /// `EXPIRE key seconds`
    Expire { key: String, seconds: u64 },
    /// `GET key`
    Get { key: String },
    /// `ZREMRANGEBYSCORE key min max` (inclusive bounds)
    SortedSetRemoveRangeByScore { key: String, min: i64, max: i64 },
    /// `ZADD key score member`
    SortedSetAdd {
        key: String,
        score: i64,
        member: String,
    },
    /// `ZCARD key`
    SortedSetCardinality { key: String },
    /// `ZCOUNT key min max` (inclusive bounds)
    SortedSetCount { key: String, min: i64, max: i64 },
    /// `HMGET key field...`
    HashGetMulti { key: String, fields: Vec<String> },
    /// `HSET key field value...`
    HashSetMulti {
        key: String,
        pairs: Vec<(String, String)>,
    },
    /// `DEL key...`
    Delete { keys: Vec<String> },
    /// `KEYS pattern`
    KeysMatching { pattern: String },
    /// `TTL key`
    Ttl { key: String },
}

impl Command {
    /// The Redis command name, used for logging and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Increment { .. } => "INCR",
            Command::Expire { .. } => "EXPIRE",
            Command::Get { .. } => "GET",
            Command::SortedSetRemoveRangeByScore { .. } => "ZREMRANGEBYSCORE",
            Command::SortedSetAdd { .. } => "ZADD",
            Command::SortedSetCardinality { .. } => "ZCARD",
            Command::SortedSetCount { .. } => "ZCOUNT",
            Command::HashGetMulti { .. } => "HMGET",
            Command::HashSetMulti { .. } => "HSET",
            Command::Delete { .. } => "DEL",
            Command::KeysMatching { .. } => "KEYS",
            Command::Ttl { .. } => "TTL",
        }
    }
}

/// The decoded reply to a single [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Integer replies (`INCR`, `EXPIRE`, `ZCARD`, `ZCOUNT`, `DEL`, `TTL`, ...)
    Integer(i64),
    /// A single, possibly missing, value (`GET`)
    Value(Option<String>),
    /// Multiple, possibly missing, values (`HMGET`)
    Values(Vec<Option<String>>),
    /// Key names (`KEYS`)
    Keys(Vec<String>),
    /// Status reply with no payload (`HSET`)
    Ok,
}

impl Reply {
    pub fn into_integer(self) -> Result<i64, StoreError> {
        match self {
            Reply::Integer(n) => Ok(n),
            other => Err(other.unexpected("integer")),
        }
    }

    pub fn into_value(self) -> Result<Option<String>, StoreError> {
        match self {
            Reply::Value(v) => Ok(v),
            other => Err(other.unexpected("value")),
        }
    }

    pub fn into_values(self) -> Result<Vec<Option<String>>, StoreError> {
        match self {
            Reply::Values(v) => Ok(v),
            other => Err(other.unexpected("values")),
        }
    }

    pub fn into_keys(self) -> Result<Vec<String>, StoreError> {
        match self {
            Reply::Keys(k) => Ok(k),
            other => Err(other.unexpected("keys")),
        }
    }

    fn unexpected(self, wanted: &'static str) -> StoreError {
        StoreError::UnexpectedReply {
            command: wanted,
            reply: format!("{:?}", self),
        }
    }
}

/// A shared key-value / sorted-set / hash store.
///
/// Implementations must execute each [`execute`](RateLimitStore::execute)
/// batch as one atomic unit: no command from another client may interleave
/// with the batch. Read-compute-write sequences that a batch cannot express go
/// through [`compare_and_set_hash`](RateLimitStore::compare_and_set_hash).
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Execute `commands` atomically and return one reply per command, in order.
    async fn execute(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StoreError>;

    /// Overwrite `new` fields of the hash at `key` and set its expiry to
    /// `ttl_secs`, but only if every `expected` field still holds the given
    /// value. A missing field compares equal to the empty string.
    ///
    /// Returns `false` without writing when the hash has changed.
    async fn compare_and_set_hash(
        &self,
        key: &str,
        expected: &[(String, String)],
        new: &[(String, String)],
        ttl_secs: u64,
    ) -> Result<bool, StoreError>;

    /// Human-readable memory usage of the store, when it reports one.
    async fn memory_usage(&self) -> Result<Option<String>, StoreError>;

    /// Release the underlying connections.
    async fn close(&self) -> Result<(), StoreError>;

    /// Execute a single command.
    async fn execute_one(&self, command: Command) -> Result<Reply, StoreError> {
        let name = command.name();
        self.execute(vec![command])
            .await?
            .pop()
            .ok_or(StoreError::UnexpectedReply {
                command: name,
                reply: "empty reply".to_string(),
            })
    }
}
