//! Tollgate - Distributed Rate Limiting Engine
//!
//! This crate implements a rate limiter whose state lives entirely in a shared,
//! Redis-compatible store, so any number of processes can enforce the same
//! limits. Four algorithms are supported (fixed window, sliding window, token
//! bucket, leaky bucket) and a tower middleware layer adapts the engine to an
//! HTTP request pipeline.

pub mod clock;
pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod store;
