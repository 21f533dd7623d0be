use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::ratelimit::{DefaultKeyGenerator, RateLimiter};
use tollgate::store::{RedisConfig, RedisStore};

/// Admin tool for the Tollgate rate limiter.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store URL, overriding the configuration file
    #[arg(long)]
    redis_url: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Consume one request for an identifier and print the result
    Check { endpoint: String, identifier: String },
    /// Print the current state for an identifier without consuming anything
    Status { endpoint: String, identifier: String },
    /// Clear the state for an identifier
    Reset { endpoint: String, identifier: String },
    /// Print endpoint and key counts
    Stats,
    /// Delete rate limit keys that have no expiry
    Cleanup,
    /// List the configured endpoints
    Endpoints,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = TollgateConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.redis_url {
        config.store = RedisConfig::from_url(url);
    }

    let rules = config.endpoint_rules()?;
    let store = Arc::new(RedisStore::connect(&config.store).await?);
    let limiter = RateLimiter::new(store).with_key_generator(Arc::new(DefaultKeyGenerator::new(
        config.key_namespace.clone(),
    )));
    limiter.register_rules(&rules)?;
    info!(endpoints = rules.endpoints.len(), "Rate limiter initialized");

    let output = match cli.command {
        Command::Check {
            endpoint,
            identifier,
        } => serde_json::to_value(limiter.check_limit(&identifier, &endpoint, None).await?)?,
        Command::Status {
            endpoint,
            identifier,
        } => serde_json::to_value(limiter.get_status(&identifier, &endpoint).await?)?,
        Command::Reset {
            endpoint,
            identifier,
        } => {
            limiter.reset_limit(&identifier, &endpoint).await?;
            json!({ "reset": true, "endpoint": endpoint, "identifier": identifier })
        }
        Command::Stats => serde_json::to_value(limiter.get_stats().await?)?,
        Command::Cleanup => json!({ "removed": limiter.cleanup().await? }),
        Command::Endpoints => {
            let endpoints: BTreeMap<_, _> = limiter.endpoints().into_iter().collect();
            serde_json::to_value(endpoints)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    limiter.close().await?;
    Ok(())
}

/// Logs go to stderr so stdout carries only the command's JSON output.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
