//! Shardline CLI - Operator tooling for shard routing
//!
//! - Print the configuration resolved from `SHARDLINE_*` variables
//! - Dry-run a routing decision from a JSON fixture

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shardline_deploy::ShardlineConfig;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod fixture;
mod output;

use fixture::RankFixture;
use output::PlanOutput;

/// Shardline CLI application
#[derive(Parser)]
#[command(name = "shardline")]
#[command(about = "Shardline - Shard assignment and failover tooling", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level
    #[arg(long, env = "SHARDLINE_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Emit JSON (logs and command output)
    #[arg(long, env = "SHARDLINE_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved configuration and routing policy
    Config,

    /// Rank shards for the site described by a fixture
    Rank {
        /// Fixture file (site, candidates, assignments, health)
        #[arg(short, long)]
        input: PathBuf,

        /// Override the configured routing region
        #[arg(long)]
        region: Option<String>,

        /// Rank matching regions strictly first
        #[arg(long)]
        strict: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());

    if cli.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let config = ShardlineConfig::load().context("loading SHARDLINE_* configuration")?;

    match cli.command {
        Commands::Config => {
            let view = serde_json::json!({
                "config": &config,
                "routing_policy": config.routing_policy(),
                "health": config.health_config(),
                "environment_default": config
                    .environment_default()
                    .map(|c| c.account_id.to_string()),
            });
            output::print_json(&view)
        }
        Commands::Rank {
            input,
            region,
            strict,
        } => {
            let fixture = RankFixture::load(&input)?;

            let mut policy = config.routing_policy();
            let strict = strict || policy.strict_region;
            match region {
                Some(region) => policy = policy.with_region(&region, strict),
                None => policy.strict_region = strict,
            }
            debug!(?policy, candidates = fixture.candidates.len(), "Ranking fixture");

            let plan = fixture.plan(&policy, config.health_config());
            let rendered = PlanOutput::from(&plan);
            if cli.json {
                output::print_json(&rendered)
            } else {
                output::print_plan(&rendered);
                Ok(())
            }
        }
    }
}
