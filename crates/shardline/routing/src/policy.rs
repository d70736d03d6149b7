//! Routing policy: region affinity, fallback depth and capacity target.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use shardline_types::Region;

/// Upper bound on fallback shards per plan.
pub const MAX_FALLBACKS_LIMIT: usize = 5;

/// Fallback shards per plan when not configured.
pub const DEFAULT_MAX_FALLBACKS: usize = 2;

/// Upper bound on the configured per-account domain target.
pub const MAX_TARGET_DOMAINS: u64 = 100_000;

/// Region multipliers for the first, second and later fallback regions.
const FALLBACK_REGION_MULTIPLIERS: [f64; 3] = [0.82, 0.65, 0.5];

/// Multiplier for a shard outside the requested and fallback regions.
pub const OTHER_REGION_MULTIPLIER: f64 = 0.35;

/// How sites are steered across shards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    /// Preferred region; `None` disables region affinity.
    pub region: Option<Region>,

    /// Rank matching shards strictly ahead of all others.
    pub strict_region: bool,

    /// Per-source fallback regions, consulted before `fallback_regions`.
    pub region_fallbacks: BTreeMap<Region, Vec<Region>>,

    /// Fallback regions for any source without a matrix entry.
    pub fallback_regions: Vec<Region>,

    /// Fallback shards kept behind the primary.
    pub max_fallbacks: usize,

    /// Domains per account considered full; `None` derives a fair share.
    pub target_domains_per_account: Option<u64>,

    /// Lower bound of the hash term, in `[0, 1)`.
    pub hash_spread_floor: f64,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            region: None,
            strict_region: false,
            region_fallbacks: BTreeMap::new(),
            fallback_regions: Vec::new(),
            max_fallbacks: DEFAULT_MAX_FALLBACKS,
            target_domains_per_account: None,
            hash_spread_floor: 0.5,
        }
    }
}

impl RoutingPolicy {
    pub fn with_region(mut self, region: &str, strict: bool) -> Self {
        self.region = Region::parse(region);
        self.strict_region = strict;
        self
    }

    pub fn with_fallback_regions(mut self, raw: &str) -> Self {
        self.fallback_regions = parse_region_list(raw);
        self
    }

    pub fn with_region_matrix(mut self, raw: &str) -> Self {
        self.region_fallbacks = parse_region_matrix(raw);
        self
    }

    pub fn with_max_fallbacks(mut self, raw: i64) -> Self {
        self.max_fallbacks = clamp_max_fallbacks(raw);
        self
    }

    pub fn with_target_domains(mut self, raw: i64) -> Self {
        self.target_domains_per_account = clamp_target_domains(raw);
        self
    }

    /// Fallback regions for the requested region, in preference order.
    ///
    /// The matrix entry wins over the global list; the requested region
    /// itself is never a fallback.
    pub fn fallbacks_for(&self, requested: &Region) -> Vec<Region> {
        let source = self
            .region_fallbacks
            .get(requested)
            .unwrap_or(&self.fallback_regions);

        let mut out: Vec<Region> = Vec::with_capacity(source.len());
        for region in source {
            if region != requested && !out.contains(region) {
                out.push(region.clone());
            }
        }
        out
    }

    /// Priority (lower is better) and multiplier of a shard's region.
    pub fn region_affinity(&self, region: Option<&Region>) -> (usize, f64) {
        let Some(requested) = &self.region else {
            return (0, 1.0);
        };
        if region == Some(requested) {
            return (0, 1.0);
        }

        let fallbacks = self.fallbacks_for(requested);
        match region.and_then(|r| fallbacks.iter().position(|f| f == r)) {
            Some(index) => {
                let multiplier = FALLBACK_REGION_MULTIPLIERS
                    [index.min(FALLBACK_REGION_MULTIPLIERS.len() - 1)];
                (index + 1, multiplier)
            }
            None => (fallbacks.len() + 1, OTHER_REGION_MULTIPLIER),
        }
    }
}

/// Parse `source=t1,t2; source2=t3`. Malformed entries are skipped.
pub fn parse_region_matrix(raw: &str) -> BTreeMap<Region, Vec<Region>> {
    let mut matrix = BTreeMap::new();
    for entry in raw.split(';') {
        let Some((source, targets)) = entry.split_once('=') else {
            continue;
        };
        let Some(source) = Region::parse(source) else {
            continue;
        };
        let targets = parse_region_list(targets);
        if !targets.is_empty() {
            matrix.insert(source, targets);
        }
    }
    matrix
}

/// Parse a comma separated region list, dropping blanks and repeats.
pub fn parse_region_list(raw: &str) -> Vec<Region> {
    let mut out: Vec<Region> = Vec::new();
    for region in raw.split(',').filter_map(Region::parse) {
        if !out.contains(&region) {
            out.push(region);
        }
    }
    out
}

pub fn clamp_max_fallbacks(raw: i64) -> usize {
    raw.clamp(0, MAX_FALLBACKS_LIMIT as i64) as usize
}

/// Zero or negative means "derive a fair share".
pub fn clamp_target_domains(raw: i64) -> Option<u64> {
    match raw {
        n if n <= 0 => None,
        n => Some((n as u64).min(MAX_TARGET_DOMAINS)),
    }
}
