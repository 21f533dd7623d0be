//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{EndpointRules, RateLimitConfig, DEFAULT_NAMESPACE};
use crate::store::RedisConfig;

/// Prefix of environment variables that override file settings,
/// e.g. `TOLLGATE__STORE__URL`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Shared store connection
    #[serde(default)]
    pub store: RedisConfig,

    /// Namespace prefixed to every rate limit key
    #[serde(default = "default_key_namespace")]
    pub key_namespace: String,

    /// Path to a separate rate limit rules file
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Inline endpoint rules; these win over rules from `rules_path`
    #[serde(default)]
    pub endpoints: HashMap<String, RateLimitConfig>,
}

impl Default for TollgateConfig {
    fn default() -> Self {
        Self {
            store: RedisConfig::default(),
            key_namespace: default_key_namespace(),
            rules_path: None,
            endpoints: HashMap::new(),
        }
    }
}

fn default_key_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file, then apply
    /// `TOLLGATE__`-prefixed environment overrides.
    ///
    /// Endpoint names are keys of the rule table and are taken from the file
    /// verbatim; the environment cannot override endpoint rules.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("key_namespace", DEFAULT_NAMESPACE)?;

        if let Some(path) = path {
            if !path.exists() {
                return Err(TollgateError::Config(format!(
                    "Configuration file not found: {}",
                    path.display()
                )));
            }
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .ignore_empty(true),
        );

        let mut config: TollgateConfig = builder.build()?.try_deserialize()?;

        // The layered loader folds map keys to lowercase
        config.endpoints = match path {
            Some(path) => EndpointRules::from_file(path)?.endpoints,
            None => HashMap::new(),
        };
        Ok(config)
    }

    /// Load configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// The full endpoint rule table: the rules file, overlaid with inline rules.
    pub fn endpoint_rules(&self) -> Result<EndpointRules> {
        let mut rules = match &self.rules_path {
            Some(path) => EndpointRules::from_file(path)?,
            None => EndpointRules::new(),
        };
        rules.merge(EndpointRules {
            endpoints: self.endpoints.clone(),
        });
        Ok(rules)
    }
}
