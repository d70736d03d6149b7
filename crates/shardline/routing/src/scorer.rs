//! Shard scorer
//!
//! Pure ranking of a candidate pool for one site. Every candidate gets
//!
//! ```text
//! dynamic_weight = base_weight * region * health * capacity * niche
//! score          = (floor + (1 - floor) * h) * dynamic_weight
//! ```
//!
//! where `h` is a stable hash of (site, shard key, account) mapped to
//! `[0, 1]`. The hash keeps a fixed site on the same shard across re-ranks
//! while heavier and healthier shards still win more sites in aggregate.
//! Ordering is total: exact ties fall back to region priority, cooldown,
//! penalty, shard key and account id.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shardline_health::{health_multiplier, HealthConfig};
use shardline_types::{ShardAssignmentSnapshot, ShardCandidate, ShardHealthState, ShardIdentity};

use crate::policy::RoutingPolicy;

const CAPACITY_BOOST: f64 = 0.35;
const CAPACITY_OVER_CEILING: f64 = 0.45;
const CAPACITY_FLOOR: f64 = 0.35;

const NICHE_SPREAD_BOOST: f64 = 0.2;
const NICHE_SPREAD_FLOOR: f64 = 0.6;
const NICHE_TARGET_BOOST: f64 = 0.1;
const NICHE_TARGET_FLOOR: f64 = 0.5;

/// Health records visible to one ranking pass.
#[derive(Debug, Clone, Default)]
pub struct HealthView {
    states: HashMap<ShardIdentity, ShardHealthState>,
    config: HealthConfig,
}

impl HealthView {
    pub fn new(states: HashMap<ShardIdentity, ShardHealthState>, config: HealthConfig) -> Self {
        Self { states, config }
    }

    pub fn get(&self, identity: &ShardIdentity) -> Option<&ShardHealthState> {
        self.states.get(identity)
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }
}

/// Per-factor breakdown of one candidate's score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub hash: f64,
    pub region: f64,
    pub health: f64,
    pub capacity: f64,
    pub niche: f64,
    pub dynamic_weight: f64,
}

/// A candidate with its score and tie-break keys.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: ShardCandidate,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    pub region_priority: usize,
    pub cooling_down: bool,
    pub penalty: u8,
}

/// Ranked candidates plus the non-fatal warnings raised on the way.
#[derive(Debug, Clone, Default)]
pub struct RankOutcome {
    pub ranked: Vec<ScoredCandidate>,
    pub warnings: Vec<String>,
}

/// The site being placed.
#[derive(Debug, Clone, Copy)]
pub struct SiteKey<'a> {
    pub site_id: &'a str,
    pub niche: Option<&'a str>,
}

/// Rank `candidates` for `site`, best first.
pub fn rank(
    site: SiteKey<'_>,
    candidates: &[ShardCandidate],
    policy: &RoutingPolicy,
    snapshot: &ShardAssignmentSnapshot,
    health: &HealthView,
    now: DateTime<Utc>,
) -> RankOutcome {
    let mut outcome = RankOutcome::default();
    if candidates.is_empty() {
        return outcome;
    }

    let mut matching: Vec<&ShardCandidate> = Vec::new();
    let mut others: Vec<&ShardCandidate> = Vec::new();
    match &policy.region {
        Some(requested) => {
            for candidate in candidates {
                if candidate.region.as_ref() == Some(requested) {
                    matching.push(candidate);
                } else {
                    others.push(candidate);
                }
            }
            if matching.is_empty() {
                outcome.warnings.push(if policy.strict_region {
                    format!("strict routing region '{requested}' has no matching shard; falling back to all shards")
                } else {
                    format!("no shard in routing region '{requested}'; using region-agnostic pool")
                });
            }
        }
        None => others.extend(candidates),
    }

    let niche = site
        .niche
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_lowercase);
    let factors = PoolFactors::new(candidates, policy, snapshot, niche.as_deref());

    let score_all = |pool: &[&ShardCandidate]| -> Vec<ScoredCandidate> {
        let mut scored: Vec<ScoredCandidate> = pool
            .iter()
            .map(|c| score_candidate(site.site_id, c, policy, snapshot, &factors, health, now))
            .collect();
        scored.sort_by(compare_scored);
        scored
    };

    if policy.strict_region && !matching.is_empty() {
        outcome.ranked = score_all(&matching);
        outcome.ranked.extend(score_all(&others));
    } else {
        let mut pool = matching;
        pool.extend(others);
        outcome.ranked = score_all(&pool);
    }

    outcome
}

/// Total order of scored candidates: best first.
pub fn compare_scored(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.region_priority.cmp(&b.region_priority))
        .then_with(|| a.cooling_down.cmp(&b.cooling_down))
        .then_with(|| a.penalty.cmp(&b.penalty))
        .then_with(|| a.candidate.shard_key.cmp(&b.candidate.shard_key))
        .then_with(|| a.candidate.account_id.cmp(&b.candidate.account_id))
        .then_with(|| a.candidate.connection_id.cmp(&b.candidate.connection_id))
}

/// Stable hash of (site, shard) mapped to `[0, 1]`.
pub fn hash_unit(site_id: &str, candidate: &ShardCandidate) -> f64 {
    let digest = blake3::hash(
        format!("{}:{}:{}", site_id, candidate.shard_key, candidate.account_id).as_bytes(),
    );
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head) as f64 / u64::MAX as f64
}

/// Capacity multiplier for an account holding `assigned` sites.
///
/// Up to +35% while the post-assignment load stays within `target`, then
/// at most 0.45x, decaying towards 0.35x the further over it goes.
pub fn capacity_multiplier(assigned: u64, target: f64) -> f64 {
    let target = target.max(1.0);
    let projected = (assigned + 1) as f64;
    if projected <= target {
        1.0 + CAPACITY_BOOST * (1.0 - projected / target)
    } else {
        let over = projected - target;
        (CAPACITY_OVER_CEILING / (1.0 + over / target)).max(CAPACITY_FLOOR)
    }
}

/// Niche multiplier: spread factor times target-deviation factor.
pub fn niche_multiplier(count: u64, cohort_average: f64, target_per_shard: f64) -> f64 {
    let count_f = count as f64;
    let spread = if cohort_average <= 0.0 || (count_f - cohort_average).abs() < f64::EPSILON {
        1.0
    } else if count_f < cohort_average {
        1.0 + NICHE_SPREAD_BOOST * (cohort_average - count_f) / cohort_average
    } else {
        let excess = ((count_f - cohort_average) / cohort_average).min(1.0);
        (1.0 - (1.0 - NICHE_SPREAD_FLOOR) * excess).max(NICHE_SPREAD_FLOOR)
    };

    let target = target_per_shard.max(f64::EPSILON);
    let projected = count_f + 1.0;
    let deviation = if projected <= target {
        1.0 + NICHE_TARGET_BOOST * (1.0 - projected / target)
    } else {
        (target / projected).max(NICHE_TARGET_FLOOR)
    };

    spread * deviation
}

/// Pool-wide inputs shared by every candidate's score.
struct PoolFactors<'a> {
    capacity_target: f64,
    niche: Option<NicheFactors<'a>>,
}

struct NicheFactors<'a> {
    name: &'a str,
    cohort_average: f64,
    target_per_shard: f64,
}

impl<'a> PoolFactors<'a> {
    fn new(
        candidates: &[ShardCandidate],
        policy: &RoutingPolicy,
        snapshot: &ShardAssignmentSnapshot,
        niche: Option<&'a str>,
    ) -> Self {
        let pool = candidates.len().max(1) as f64;
        let capacity_target = match policy.target_domains_per_account {
            Some(target) => target as f64,
            None => ((snapshot.total_assigned + 1) as f64 / pool).ceil(),
        };

        let niche = niche.map(|name| {
            let total: u64 = candidates
                .iter()
                .map(|c| snapshot.niche_count(&c.account_id, name))
                .sum();
            NicheFactors {
                name,
                cohort_average: total as f64 / pool,
                target_per_shard: (snapshot.niche_total(name) + 1) as f64 / pool,
            }
        });

        Self {
            capacity_target,
            niche,
        }
    }
}

fn score_candidate(
    site_id: &str,
    candidate: &ShardCandidate,
    policy: &RoutingPolicy,
    snapshot: &ShardAssignmentSnapshot,
    factors: &PoolFactors<'_>,
    health: &HealthView,
    now: DateTime<Utc>,
) -> ScoredCandidate {
    let (region_priority, region) = policy.region_affinity(candidate.region.as_ref());

    let identity = candidate.identity();
    let state = health.get(&identity);
    let health_factor = health_multiplier(state, now, health.config());

    let capacity = capacity_multiplier(
        snapshot.assigned_to(&candidate.account_id),
        factors.capacity_target,
    );

    let niche = factors.niche.as_ref().map_or(1.0, |n| {
        niche_multiplier(
            snapshot.niche_count(&candidate.account_id, n.name),
            n.cohort_average,
            n.target_per_shard,
        )
    });

    let dynamic_weight = f64::from(candidate.base_weight) * region * health_factor * capacity * niche;
    let floor = policy.hash_spread_floor.clamp(0.0, 0.99);
    let hash = floor + (1.0 - floor) * hash_unit(site_id, candidate);

    ScoredCandidate {
        candidate: candidate.clone(),
        score: hash * dynamic_weight,
        breakdown: ScoreBreakdown {
            hash,
            region,
            health: health_factor,
            capacity,
            niche,
            dynamic_weight,
        },
        region_priority,
        cooling_down: state.is_some_and(|s| s.is_cooling_down(now)),
        penalty: state.map_or(0, |s| s.penalty),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use shardline_types::{AccountId, ConnectionId, Region, ShardKey};

    fn candidate(key: &str, account: &str, region: Option<&str>, weight: u32) -> ShardCandidate {
        ShardCandidate {
            connection_id: ConnectionId::new(format!("conn-{key}")),
            shard_key: ShardKey::new(key),
            account_id: AccountId::new(account),
            credential: format!("token-{key}"),
            region: region.and_then(Region::parse),
            base_weight: weight,
        }
    }

    fn site(id: &str) -> SiteKey<'_> {
        SiteKey {
            site_id: id,
            niche: None,
        }
    }

    fn keys(outcome: &RankOutcome) -> Vec<&str> {
        outcome.ranked.iter().map(|s| s.candidate.shard_key.as_str()).collect()
    }

    fn pool() -> Vec<ShardCandidate> {
        vec![
            candidate("east-1", "acct-a", Some("us-east"), 100),
            candidate("east-2", "acct-b", Some("us-east"), 100),
            candidate("west-1", "acct-c", Some("us-west"), 100),
            candidate("eu-1", "acct-d", Some("eu-west"), 100),
        ]
    }

    #[test]
    fn test_empty_pool() {
        let outcome = rank(
            site("s"),
            &[],
            &RoutingPolicy::default(),
            &ShardAssignmentSnapshot::default(),
            &HealthView::default(),
            Utc::now(),
        );
        assert!(outcome.ranked.is_empty());
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_capacity_multiplier_shape() {
        assert!((capacity_multiplier(0, 10.0) - 1.315).abs() < 1e-9);
        assert!((capacity_multiplier(9, 10.0) - 1.0).abs() < 1e-9);
        assert!(capacity_multiplier(10, 10.0) <= CAPACITY_OVER_CEILING);
        assert!((capacity_multiplier(10_000, 10.0) - CAPACITY_FLOOR).abs() < 1e-9);
    }

    #[test]
    fn test_niche_multiplier_shape() {
        // Below the cohort average and under target: both factors boost.
        assert!(niche_multiplier(0, 2.0, 3.0) > 1.2);
        // Above average and above target: both factors penalize.
        let heavy = niche_multiplier(6, 2.0, 3.0);
        assert!((heavy - 0.6 * 0.5).abs() < 1e-9);
        // Nothing assigned anywhere yet.
        assert!(niche_multiplier(0, 0.0, 0.25) <= 1.0 + NICHE_TARGET_BOOST);
    }

    #[test]
    fn test_strict_region_ranks_matches_first() {
        let mut candidates = pool();
        // A much heavier off-region shard still may not jump the queue.
        candidates.push(candidate("west-big", "acct-e", Some("us-west"), 10_000));
        let policy = RoutingPolicy::default().with_region("us-east", true);

        for id in ["site-1", "site-2", "site-3", "site-4"] {
            let outcome = rank(
                site(id),
                &candidates,
                &policy,
                &ShardAssignmentSnapshot::default(),
                &HealthView::default(),
                Utc::now(),
            );
            let order = keys(&outcome);
            assert_eq!(order.len(), 5);
            let mut head = order[..2].to_vec();
            head.sort();
            assert_eq!(head, vec!["east-1", "east-2"]);
            assert!(outcome.warnings.is_empty());
        }
    }

    #[test]
    fn test_region_fallback_warnings_differ_by_strictness() {
        let snapshot = ShardAssignmentSnapshot::default();
        let health = HealthView::default();
        let now = Utc::now();

        let loose = rank(site("s"), &pool(), &RoutingPolicy::default().with_region("apac", false), &snapshot, &health, now);
        let strict = rank(site("s"), &pool(), &RoutingPolicy::default().with_region("apac", true), &snapshot, &health, now);

        assert_eq!(loose.ranked.len(), 4);
        assert_eq!(strict.ranked.len(), 4);
        assert_eq!(loose.warnings.len(), 1);
        assert_eq!(strict.warnings.len(), 1);
        assert_ne!(loose.warnings[0], strict.warnings[0]);
        assert!(strict.warnings[0].contains("strict"));
    }

    #[test]
    fn test_under_target_beats_over_target() {
        let candidates = vec![
            candidate("full", "acct-full", None, 100),
            candidate("light", "acct-light", None, 100),
        ];
        let mut snapshot = ShardAssignmentSnapshot::default();
        for _ in 0..15 {
            snapshot.record(&AccountId::new("acct-full"), None);
        }
        for _ in 0..3 {
            snapshot.record(&AccountId::new("acct-light"), None);
        }
        let policy = RoutingPolicy::default().with_target_domains(10);

        for n in 0..50 {
            let id = format!("site-{n}");
            let outcome = rank(site(&id), &candidates, &policy, &snapshot, &HealthView::default(), Utc::now());
            assert_eq!(keys(&outcome)[0], "light", "site {id}");
        }
    }

    #[test]
    fn test_cooling_shard_ranks_last() {
        let candidates = pool();
        let now = Utc::now();
        let cooling = candidates[0].identity();
        let mut state = ShardHealthState::fresh(now);
        state.penalty = 2;
        state.cooldown_until = Some(now + chrono::Duration::seconds(30));
        let health = HealthView::new(HashMap::from([(cooling, state)]), HealthConfig::default());

        for n in 0..50 {
            let id = format!("site-{n}");
            let outcome = rank(
                site(&id),
                &candidates,
                &RoutingPolicy::default(),
                &ShardAssignmentSnapshot::default(),
                &health,
                now,
            );
            assert_eq!(keys(&outcome)[3], "east-1");
            assert!(outcome.ranked[3].cooling_down);
            assert_eq!(outcome.ranked[3].breakdown.health, 0.05);
        }
    }

    #[test]
    fn test_heavier_shard_always_wins_by_wide_margin() {
        let candidates = vec![
            candidate("small", "acct-a", None, 100),
            candidate("large", "acct-b", None, 300),
        ];
        for n in 0..100 {
            let id = format!("site-{n}");
            let outcome = rank(
                site(&id),
                &candidates,
                &RoutingPolicy::default(),
                &ShardAssignmentSnapshot::default(),
                &HealthView::default(),
                Utc::now(),
            );
            assert_eq!(keys(&outcome)[0], "large");
        }
    }

    #[test]
    fn test_ties_break_on_priority_then_health_then_key() {
        let make = |key: &str, priority: usize, cooling: bool, penalty: u8| ScoredCandidate {
            candidate: candidate(key, "acct", None, 100),
            score: 1.0,
            breakdown: ScoreBreakdown {
                hash: 1.0,
                region: 1.0,
                health: 1.0,
                capacity: 1.0,
                niche: 1.0,
                dynamic_weight: 1.0,
            },
            region_priority: priority,
            cooling_down: cooling,
            penalty,
        };

        let mut scored = vec![
            make("d", 0, false, 0),
            make("c", 0, false, 3),
            make("b", 0, true, 0),
            make("a", 1, false, 0),
            make("e", 0, false, 0),
        ];
        scored.sort_by(compare_scored);
        let order: Vec<_> = scored.iter().map(|s| s.candidate.shard_key.as_str()).collect();
        assert_eq!(order, vec!["d", "e", "c", "b", "a"]);
    }

    #[test]
    fn test_niche_spreads_sites() {
        let candidates = vec![
            candidate("travel-heavy", "acct-a", None, 100),
            candidate("travel-light", "acct-b", None, 100),
        ];
        let mut snapshot = ShardAssignmentSnapshot::default();
        for _ in 0..6 {
            snapshot.record(&AccountId::new("acct-a"), Some("travel"));
            snapshot.record(&AccountId::new("acct-b"), Some("finance"));
        }
        let outcome = rank(
            SiteKey {
                site_id: "site-x",
                niche: Some(" Travel "),
            },
            &candidates,
            &RoutingPolicy::default(),
            &snapshot,
            &HealthView::default(),
            Utc::now(),
        );
        let heavy = &outcome.ranked.iter().find(|s| s.candidate.shard_key.as_str() == "travel-heavy").unwrap();
        let light = &outcome.ranked.iter().find(|s| s.candidate.shard_key.as_str() == "travel-light").unwrap();
        assert!(light.breakdown.niche > 1.0);
        assert!(heavy.breakdown.niche < 0.5);
    }

    proptest! {
        #[test]
        fn ranking_is_deterministic(
            site_id in "[a-z0-9-]{1,24}",
            weights in prop::collection::vec(1u32..5000, 1..8),
            assigned in prop::collection::vec(0u64..40, 8),
        ) {
            let candidates: Vec<ShardCandidate> = weights
                .iter()
                .enumerate()
                .map(|(i, w)| candidate(&format!("shard-{i}"), &format!("acct-{i}"), None, *w))
                .collect();
            let mut snapshot = ShardAssignmentSnapshot::default();
            for (i, count) in assigned.iter().enumerate().take(candidates.len()) {
                for _ in 0..*count {
                    snapshot.record(&AccountId::new(format!("acct-{i}")), None);
                }
            }
            let now = Utc::now();
            let policy = RoutingPolicy::default();
            let health = HealthView::default();

            let first = rank(SiteKey { site_id: &site_id, niche: None }, &candidates, &policy, &snapshot, &health, now);
            let mut reversed = candidates.clone();
            reversed.reverse();
            let second = rank(SiteKey { site_id: &site_id, niche: None }, &reversed, &policy, &snapshot, &health, now);

            prop_assert_eq!(keys(&first), keys(&second));
            prop_assert_eq!(first.ranked.len(), candidates.len());
        }
    }
}
