//! The rate limiter engine.

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::error::RateLimitError;
use super::key::{DefaultKeyGenerator, KeyGenerator, RateLimitKey};
use super::result::RateLimitResult;
use super::rules::{EndpointRules, RateLimitConfig};
use super::strategy::window_key_pattern;
use crate::clock::{Clock, SystemClock};
use crate::store::{Command, RateLimitStore};

/// A snapshot of the limiter's footprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStats {
    /// Registered endpoints
    pub total_endpoints: usize,
    /// Store keys in the limiter's namespace
    pub total_keys: usize,
    /// Store-reported memory usage, if the store reports one
    pub memory_usage: Option<String>,
}

/// The rate limiter engine.
///
/// Holds the endpoint registry and dispatches checks to the configured
/// algorithm. All counting state lives in the store, so any number of
/// limiters sharing a store enforce the same limits.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    key_generator: Arc<dyn KeyGenerator>,
    clock: Arc<dyn Clock>,
    /// Endpoint name -> configuration
    endpoints: DashMap<String, RateLimitConfig>,
}

impl RateLimiter {
    /// Create a limiter with the default key generator and the system clock.
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            store,
            key_generator: Arc::new(DefaultKeyGenerator::default()),
            clock: Arc::new(SystemClock),
            endpoints: DashMap::new(),
        }
    }

    pub fn with_key_generator(mut self, key_generator: Arc<dyn KeyGenerator>) -> Self {
        self.key_generator = key_generator;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register (or replace) the configuration for `endpoint`.
    pub fn register_endpoint(
        &self,
        endpoint: impl Into<String>,
        config: RateLimitConfig,
    ) -> Result<(), RateLimitError> {
        let endpoint = endpoint.into();
        config.validate()?;

        info!(
            endpoint = %endpoint,
            algorithm = %config.algorithm,
            window_size_ms = config.window_size_ms,
            max_requests = config.max_requests,
            "Registered rate limit"
        );
        self.endpoints.insert(endpoint, config);
        Ok(())
    }

    /// Register every endpoint in `rules`, stopping at the first invalid one.
    pub fn register_rules(&self, rules: &EndpointRules) -> Result<(), RateLimitError> {
        for (endpoint, config) in &rules.endpoints {
            self.register_endpoint(endpoint.clone(), config.clone())
                .map_err(|e| match e {
                    RateLimitError::Validation(msg) => {
                        RateLimitError::Validation(format!("endpoint {}: {}", endpoint, msg))
                    }
                    other => other,
                })?;
        }
        Ok(())
    }

    /// The configuration registered for `endpoint`.
    pub fn endpoint_config(&self, endpoint: &str) -> Option<RateLimitConfig> {
        self.endpoints.get(endpoint).map(|c| c.value().clone())
    }

    /// Registered endpoints, sorted by name.
    pub fn endpoints(&self) -> Vec<(String, RateLimitConfig)> {
        let mut all: Vec<_> = self
            .endpoints
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Consume one unit of capacity for `identifier` on `endpoint`.
    ///
    /// `custom_config` takes precedence over the registered configuration.
    pub async fn check_limit(
        &self,
        identifier: &str,
        endpoint: &str,
        custom_config: Option<&RateLimitConfig>,
    ) -> Result<RateLimitResult, RateLimitError> {
        let config = match custom_config {
            Some(config) => {
                config.validate()?;
                config.clone()
            }
            None => self.endpoint_config(endpoint).ok_or_else(|| {
                RateLimitError::Configuration(format!(
                    "No rate limit configuration for endpoint: {}",
                    endpoint
                ))
            })?,
        };

        let key = self.key_generator.generate_key(identifier, endpoint);
        let now = self.clock.now_ms();

        trace!(key = %key, algorithm = %config.algorithm, "Checking rate limit");

        let result = config
            .algorithm
            .check(self.store.as_ref(), &key, &config, now)
            .await?;

        if !result.allowed {
            debug!(
                key = %key,
                total_hits = result.total_hits,
                retry_after = ?result.retry_after,
                "Rate limit exceeded"
            );
        }
        Ok(result)
    }

    /// Clear the stored state for `identifier` on `endpoint`.
    ///
    /// Removes the base key and every fixed window counter derived from it,
    /// whichever configuration the checks ran with.
    pub async fn reset_limit(&self, identifier: &str, endpoint: &str) -> Result<(), RateLimitError> {
        let key = self.key_generator.generate_key(identifier, endpoint);

        let mut keys = self
            .store
            .execute_one(Command::KeysMatching {
                pattern: window_key_pattern(&key),
            })
            .await?
            .into_keys()?;
        keys.push(key.clone());

        self.store.execute_one(Command::Delete { keys }).await?;
        info!(key = %key, "Reset rate limit");
        Ok(())
    }

    /// Report the state for `identifier` on `endpoint` without consuming
    /// capacity, or `None` if the endpoint is not registered.
    pub async fn get_status(
        &self,
        identifier: &str,
        endpoint: &str,
    ) -> Result<Option<RateLimitResult>, RateLimitError> {
        let Some(config) = self.endpoint_config(endpoint) else {
            return Ok(None);
        };

        let key = self.key_generator.generate_key(identifier, endpoint);
        let result = config
            .algorithm
            .peek(self.store.as_ref(), &key, &config, self.clock.now_ms())
            .await?;
        Ok(Some(result))
    }

    /// Check every request concurrently against its registered endpoint.
    ///
    /// A request whose check fails is logged and left out of the map, so one
    /// bad key never hides the results of the others.
    pub async fn batch_check(
        &self,
        requests: &[RateLimitKey],
    ) -> HashMap<RateLimitKey, RateLimitResult> {
        let checks = requests.iter().map(|request| async move {
            let outcome = self
                .check_limit(&request.identifier, &request.endpoint, None)
                .await;
            (request, outcome)
        });

        let mut results = HashMap::with_capacity(requests.len());
        for (request, outcome) in join_all(checks).await {
            match outcome {
                Ok(result) => {
                    results.insert(request.clone(), result);
                }
                Err(e) => {
                    warn!(request = %request, error = %e, "Batch rate limit check failed");
                }
            }
        }
        results
    }

    /// Count registered endpoints and the store keys in the namespace.
    pub async fn get_stats(&self) -> Result<LimiterStats, RateLimitError> {
        let keys = self.namespace_keys().await?;
        let memory_usage = self.store.memory_usage().await?;

        Ok(LimiterStats {
            total_endpoints: self.endpoints.len(),
            total_keys: keys.len(),
            memory_usage,
        })
    }

    /// Delete namespace keys that carry no expiry, returning how many were
    /// removed. Every key the algorithms write has a TTL, so these are
    /// leftovers from interrupted writes or foreign clients.
    pub async fn cleanup(&self) -> Result<usize, RateLimitError> {
        let keys = self.namespace_keys().await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let ttls = self
            .store
            .execute(
                keys.iter()
                    .map(|key| Command::Ttl { key: key.clone() })
                    .collect(),
            )
            .await?;

        let mut stale = Vec::new();
        for (key, ttl) in keys.into_iter().zip(ttls) {
            if ttl.into_integer()? == -1 {
                stale.push(key);
            }
        }
        if stale.is_empty() {
            return Ok(0);
        }

        let removed = self
            .store
            .execute_one(Command::Delete { keys: stale })
            .await?
            .into_integer()?
            .max(0) as usize;

        info!(removed = removed, "Cleaned up rate limit keys without expiry");
        Ok(removed)
    }

    /// Close the underlying store.
    pub async fn close(&self) -> Result<(), RateLimitError> {
        self.store.close().await?;
        info!("Rate limiter closed");
        Ok(())
    }

    async fn namespace_keys(&self) -> Result<Vec<String>, RateLimitError> {
        let keys = self
            .store
            .execute_one(Command::KeysMatching {
                pattern: self.key_generator.key_pattern(),
            })
            .await?
            .into_keys()?;
        Ok(keys)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("endpoints", &self.endpoints.len())
            .field("key_pattern", &self.key_generator.key_pattern())
            .finish()
    }
}
