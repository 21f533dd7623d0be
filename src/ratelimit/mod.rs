//! Rate limiting logic: rules, algorithms and the engine that ties them to a store.

mod error;
mod key;
mod limiter;
mod result;
mod rules;
mod strategy;

pub use error::RateLimitError;
pub use key::{escape_glob, DefaultKeyGenerator, KeyGenerator, RateLimitKey, DEFAULT_NAMESPACE};
pub use limiter::{LimiterStats, RateLimiter};
pub use result::RateLimitResult;
pub use rules::{
    Algorithm, EndpointRules, RateLimitConfig, DEFAULT_LEAK_RATE, DEFAULT_REFILL_RATE, MAX_WINDOW_MS,
};
