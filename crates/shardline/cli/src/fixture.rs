//! Ranking fixtures
//!
//! A fixture captures everything a routing decision depends on (the site,
//! the candidate pool, live assignments and health records) so a plan can
//! be reproduced offline.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shardline_health::HealthConfig;
use shardline_routing::{plan_candidates, HealthView, RoutingPolicy, ShardPlan, SiteRequest};
use shardline_types::{
    AccountId, ConnectionId, Region, ShardAssignmentSnapshot, ShardCandidate, ShardHealthState,
    ShardIdentity, ShardKey, SiteAssignment,
};

/// A candidate as written in a fixture file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureCandidate {
    #[serde(default)]
    pub connection_id: Option<String>,
    pub shard_key: String,
    pub account_id: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub weight: Option<i64>,
}

impl FixtureCandidate {
    fn into_candidate(self, index: usize) -> ShardCandidate {
        ShardCandidate {
            connection_id: ConnectionId::new(
                self.connection_id
                    .unwrap_or_else(|| format!("fixture-{index}")),
            ),
            shard_key: ShardKey::new(&self.shard_key),
            account_id: AccountId::parse_canonical(&self.account_id)
                .unwrap_or_else(|| AccountId::new(self.account_id.trim())),
            credential: String::new(),
            region: self.region.as_deref().and_then(Region::parse),
            base_weight: ShardCandidate::clamp_weight(self.weight),
        }
    }
}

/// A health record as written in a fixture file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureHealth {
    pub shard_key: String,
    pub account_id: String,
    #[serde(flatten)]
    pub state: ShardHealthState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankFixture {
    pub site: SiteRequest,
    pub candidates: Vec<FixtureCandidate>,
    #[serde(default)]
    pub assignments: Vec<SiteAssignment>,
    #[serde(default)]
    pub health: Vec<FixtureHealth>,
    /// Evaluation time; defaults to now.
    #[serde(default)]
    pub now: Option<DateTime<Utc>>,
}

impl RankFixture {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing fixture {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Plan the fixture's site under `policy`.
    pub fn plan(&self, policy: &RoutingPolicy, health_config: HealthConfig) -> ShardPlan {
        let candidates: Vec<ShardCandidate> = self
            .candidates
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, c)| c.into_candidate(i))
            .collect();

        let snapshot = ShardAssignmentSnapshot::from_assignments(&self.assignments);

        let states: HashMap<ShardIdentity, ShardHealthState> = self
            .health
            .iter()
            .map(|h| {
                let account = AccountId::parse_canonical(&h.account_id)
                    .unwrap_or_else(|| AccountId::new(h.account_id.trim()));
                (ShardIdentity::new(ShardKey::new(&h.shard_key), account), h.state.clone())
            })
            .collect();

        let now = self.now.unwrap_or_else(Utc::now);
        let health = HealthView::new(states, health_config);
        plan_candidates(&self.site, &candidates, policy, &snapshot, &health, now)
    }
}
