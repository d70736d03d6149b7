//! Configuration for Shardline
//!
//! Every setting comes from `SHARDLINE_*` environment variables layered over
//! the defaults below. Numeric values are clamped rather than rejected.

use std::collections::HashMap;
use std::time::Duration;

use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use shardline_health::HealthConfig;
use shardline_routing::{environment_credentials, RoutingPolicy};
use shardline_types::ProviderCredentials;

use crate::error::Result;
use crate::orchestrator::OrchestratorSettings;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SHARDLINE";

const STEP_TIMEOUT_RANGE: (i64, i64) = (1, 600);
const CONCURRENCY_RANGE: (i64, i64) = (1, 64);
const TTL_RANGE: (i64, i64) = (1, 3600);

/// Resolved process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardlineConfig {
    /// Preferred routing region, e.g. `us-east`.
    #[serde(default)]
    pub routing_region: Option<String>,

    /// Keep non-matching regions behind matching ones.
    #[serde(default)]
    pub strict_region: bool,

    /// Per-region fallbacks: `source=t1,t2; source2=t3`.
    #[serde(default)]
    pub region_fallbacks: Option<String>,

    /// Comma-separated fallback regions used when the matrix has no entry.
    #[serde(default)]
    pub fallback_regions: Option<String>,

    #[serde(default = "default_max_fallbacks")]
    pub max_fallbacks: i64,

    /// Capacity hint; 0 derives a fair share from current load.
    #[serde(default)]
    pub target_domains_per_account: i64,

    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: i64,

    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: i64,

    /// Environment fallback account used when no shard connection exists.
    #[serde(default)]
    pub default_account_id: Option<String>,

    #[serde(default, skip_serializing)]
    pub default_api_token: Option<String>,

    #[serde(default = "default_registry_ttl")]
    pub registry_ttl_secs: i64,

    #[serde(default = "default_snapshot_ttl")]
    pub snapshot_ttl_secs: i64,

    #[serde(default = "default_health_reload")]
    pub health_reload_secs: i64,
}

fn default_max_fallbacks() -> i64 {
    2
}

fn default_step_timeout() -> i64 {
    60
}

fn default_max_concurrent_jobs() -> i64 {
    4
}

fn default_registry_ttl() -> i64 {
    60
}

fn default_snapshot_ttl() -> i64 {
    30
}

fn default_health_reload() -> i64 {
    60
}

impl Default for ShardlineConfig {
    fn default() -> Self {
        Self {
            routing_region: None,
            strict_region: false,
            region_fallbacks: None,
            fallback_regions: None,
            max_fallbacks: default_max_fallbacks(),
            target_domains_per_account: 0,
            step_timeout_secs: default_step_timeout(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            default_account_id: None,
            default_api_token: None,
            registry_ttl_secs: default_registry_ttl(),
            snapshot_ttl_secs: default_snapshot_ttl(),
            health_reload_secs: default_health_reload(),
        }
    }
}

impl ShardlineConfig {
    /// Load from the process environment.
    pub fn load() -> Result<Self> {
        Self::load_with(None)
    }

    /// Load from `vars` instead of the process environment when given.
    pub fn load_with(vars: Option<HashMap<String, String>>) -> Result<Self> {
        let defaults = Config::try_from(&ShardlineConfig::default())?;
        let settings = Config::builder()
            .add_source(defaults)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .source(vars),
            )
            .build()?;

        let config: ShardlineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the health breaker cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.health_config().validate()?;
        Ok(())
    }

    pub fn routing_policy(&self) -> RoutingPolicy {
        let mut policy = RoutingPolicy::default()
            .with_max_fallbacks(self.max_fallbacks)
            .with_target_domains(self.target_domains_per_account);

        if let Some(region) = non_empty(&self.routing_region) {
            policy = policy.with_region(region, self.strict_region);
        }
        if let Some(matrix) = non_empty(&self.region_fallbacks) {
            policy = policy.with_region_matrix(matrix);
        }
        if let Some(list) = non_empty(&self.fallback_regions) {
            policy = policy.with_fallback_regions(list);
        }
        policy
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig::default().with_reload_interval(Self::seconds(self.health_reload_secs, TTL_RANGE))
    }

    pub fn registry_ttl(&self) -> Duration {
        Self::seconds(self.registry_ttl_secs, TTL_RANGE)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Self::seconds(self.snapshot_ttl_secs, TTL_RANGE)
    }

    pub fn step_timeout(&self) -> Duration {
        Self::seconds(self.step_timeout_secs, STEP_TIMEOUT_RANGE)
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs
            .clamp(CONCURRENCY_RANGE.0, CONCURRENCY_RANGE.1) as usize
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            step_timeout: self.step_timeout(),
        }
    }

    /// Environment fallback credentials, when both parts are set.
    pub fn environment_default(&self) -> Option<ProviderCredentials> {
        environment_credentials(
            self.default_account_id.as_deref(),
            self.default_api_token.as_deref(),
        )
    }

    fn seconds(raw: i64, (min, max): (i64, i64)) -> Duration {
        Duration::from_secs(raw.clamp(min, max) as u64)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
