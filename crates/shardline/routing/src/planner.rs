//! Shard planner
//!
//! Builds the ordered shard plan (primary + fallbacks) for one site from the
//! live registry, health store and assignment snapshot.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shardline_health::ShardHealthStore;
use shardline_registry::{AssignmentSnapshotCache, ShardRegistry};
use shardline_types::{
    AccountId, AssignmentStrategy, ConnectionId, ProviderCredentials, RankedShard,
    ShardAssignmentSnapshot, ShardCandidate, ShardKey, ShardSource, DEFAULT_BASE_WEIGHT,
};
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, RoutingError};
use crate::policy::RoutingPolicy;
use crate::scorer::{self, HealthView, SiteKey};

/// Shard key given to the environment default account.
pub const ENVIRONMENT_SHARD_KEY: &str = "default";

/// A site awaiting placement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteRequest {
    /// Stable identifier fed into the hash term.
    pub site_id: String,

    /// Topical category, if known.
    #[serde(default)]
    pub niche: Option<String>,

    /// Pin to a shard key, account id or connection id.
    #[serde(default)]
    pub pinned_shard: Option<String>,
}

impl SiteRequest {
    pub fn new(site_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            ..Self::default()
        }
    }

    pub fn with_niche(mut self, niche: impl Into<String>) -> Self {
        self.niche = Some(niche.into());
        self
    }

    pub fn pinned_to(mut self, shard: impl Into<String>) -> Self {
        self.pinned_shard = Some(shard.into());
        self
    }
}

/// Ordered shards to try for one site.
#[derive(Debug, Clone)]
pub struct ShardPlan {
    pub site_id: String,
    pub shards: Vec<RankedShard>,
    pub warnings: Vec<String>,
}

impl ShardPlan {
    pub fn primary(&self) -> Option<&RankedShard> {
        self.shards.first()
    }

    pub fn fallbacks(&self) -> &[RankedShard] {
        self.shards.get(1..).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

/// Rank `candidates` into a plan without touching any cache.
///
/// Handles the pinned-shard override and truncates to the policy's fallback
/// depth; the planner and the operator dry-run both go through here.
pub fn plan_candidates(
    site: &SiteRequest,
    candidates: &[ShardCandidate],
    policy: &RoutingPolicy,
    snapshot: &ShardAssignmentSnapshot,
    health: &HealthView,
    now: DateTime<Utc>,
) -> ShardPlan {
    let mut warnings = Vec::new();
    let key = SiteKey {
        site_id: &site.site_id,
        niche: site.niche.as_deref(),
    };

    let pinned = site.pinned_shard.as_deref().and_then(|raw| {
        let found = find_override(candidates, raw);
        if found.is_none() {
            warnings.push(format!(
                "shard override '{}' matched no shard; using hash-bucket ranking",
                raw.trim()
            ));
        }
        found
    });

    let mut shards = Vec::with_capacity(policy.max_fallbacks + 1);
    let pool: Vec<ShardCandidate> = match pinned {
        Some(primary) => {
            let identity = primary.identity();
            if health.get(&identity).is_some_and(|s| s.is_cooling_down(now)) {
                warnings.push(format!("pinned shard '{}' is cooling down", primary.shard_key));
            }
            shards.push(RankedShard::new(
                primary.clone(),
                AssignmentStrategy::DomainOverride,
                ShardSource::ExplicitOverride,
            ));
            candidates
                .iter()
                .filter(|c| c.identity() != identity)
                .cloned()
                .collect()
        }
        None => candidates.to_vec(),
    };

    let outcome = scorer::rank(key, &pool, policy, snapshot, health, now);
    warnings.extend(outcome.warnings);

    for scored in outcome.ranked {
        let mut ranked = RankedShard::new(
            scored.candidate,
            AssignmentStrategy::HashBucket,
            ShardSource::ResolvedReference,
        );
        ranked.score = Some(scored.score);
        shards.push(ranked);
    }
    shards.truncate(policy.max_fallbacks + 1);

    if let Some(primary) = shards.first_mut() {
        primary.warnings.extend(warnings.iter().cloned());
    }

    ShardPlan {
        site_id: site.site_id.clone(),
        shards,
        warnings,
    }
}

/// Match an override against shard key, account id or connection id.
fn find_override<'a>(candidates: &'a [ShardCandidate], raw: &str) -> Option<&'a ShardCandidate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let key = ShardKey::new(raw);
    candidates.iter().find(|c| {
        c.shard_key == key
            || c.account_id.as_str().eq_ignore_ascii_case(raw)
            || c.connection_id.as_str() == raw
    })
}

/// Plans shards for sites from live registry, health and load data.
pub struct ShardPlanner {
    registry: Arc<ShardRegistry>,
    health: Arc<ShardHealthStore>,
    snapshots: Arc<AssignmentSnapshotCache>,
    policy: RoutingPolicy,
    environment_default: Option<ProviderCredentials>,
}

impl ShardPlanner {
    pub fn new(
        registry: Arc<ShardRegistry>,
        health: Arc<ShardHealthStore>,
        snapshots: Arc<AssignmentSnapshotCache>,
        policy: RoutingPolicy,
    ) -> Self {
        Self {
            registry,
            health,
            snapshots,
            policy,
            environment_default: None,
        }
    }

    /// Account used when the registry has no shard at all.
    pub fn with_environment_default(mut self, credentials: Option<ProviderCredentials>) -> Self {
        self.environment_default = credentials;
        self
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    pub fn health(&self) -> &Arc<ShardHealthStore> {
        &self.health
    }

    pub async fn plan(&self, site: &SiteRequest) -> Result<ShardPlan> {
        self.plan_at(site, Utc::now()).await
    }

    /// Build the plan for `site` as of `now`.
    #[instrument(skip(self, site), fields(site_id = %site.site_id))]
    pub async fn plan_at(&self, site: &SiteRequest, now: DateTime<Utc>) -> Result<ShardPlan> {
        let candidates = self.registry.candidates().await?;

        if candidates.is_empty() {
            return self.environment_plan(site);
        }

        self.health.ensure_reloaded().await;

        let mut degraded = Vec::new();
        let snapshot = match self.snapshots.snapshot(&candidates).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Assignment snapshot unavailable; ranking without load data");
                degraded.push("assignment counts unavailable; load balancing disabled for this plan".to_string());
                Arc::new(ShardAssignmentSnapshot::default())
            }
        };

        let health = HealthView::new(self.health.snapshot_at(now), self.health.config().clone());
        let mut plan = plan_candidates(site, &candidates, &self.policy, &snapshot, &health, now);

        if !degraded.is_empty() {
            if let Some(primary) = plan.shards.first_mut() {
                primary.warnings.extend(degraded.iter().cloned());
            }
            plan.warnings.extend(degraded);
        }

        if let Some(primary) = plan.primary() {
            info!(
                shard_key = %primary.shard_key(),
                account_id = %primary.account_id(),
                strategy = %primary.strategy,
                fallbacks = plan.fallbacks().len(),
                warnings = plan.warnings.len(),
                "Shard plan ready"
            );
        }
        for warning in &plan.warnings {
            debug!(warning = %warning, "Routing warning");
        }

        Ok(plan)
    }

    fn environment_plan(&self, site: &SiteRequest) -> Result<ShardPlan> {
        let Some(credentials) = &self.environment_default else {
            warn!("No shard candidates and no environment default account");
            return Err(RoutingError::NoCandidates);
        };

        let candidate = ShardCandidate {
            connection_id: ConnectionId::new("environment"),
            shard_key: ShardKey::new(ENVIRONMENT_SHARD_KEY),
            account_id: credentials.account_id.clone(),
            credential: credentials.api_token.clone(),
            region: None,
            base_weight: DEFAULT_BASE_WEIGHT,
        };
        let warning = "no shard connections available; using the environment default account".to_string();
        let mut shard = RankedShard::new(candidate, AssignmentStrategy::Default, ShardSource::EnvironmentFallback);
        shard.warnings.push(warning.clone());

        warn!(account_id = %credentials.account_id, "Routing to environment default account");

        Ok(ShardPlan {
            site_id: site.site_id.clone(),
            shards: vec![shard],
            warnings: vec![warning],
        })
    }
}

/// Environment default credentials, if both parts are present.
pub fn environment_credentials(account_id: Option<&str>, api_token: Option<&str>) -> Option<ProviderCredentials> {
    let account_id = account_id.map(str::trim).filter(|s| !s.is_empty())?;
    let api_token = api_token.map(str::trim).filter(|s| !s.is_empty())?;
    Some(ProviderCredentials {
        account_id: AccountId::parse_canonical(account_id).unwrap_or_else(|| AccountId::new(account_id)),
        api_token: api_token.to_string(),
    })
}
