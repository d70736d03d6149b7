//! # Shardline Routing - Which account serves a site
//!
//! Ranking is split into a pure core and a thin async shell:
//!
//! - [`scorer::rank`] orders a candidate pool for one site from the routing
//!   policy, an assignment snapshot and a health view. Same inputs, same
//!   order.
//! - [`ShardPlanner`] gathers those inputs from the live caches, applies
//!   per-site overrides and the environment default account, and truncates
//!   the ranking to a primary plus bounded fallbacks.
//!
//! ## Example
//!
//! ```rust,ignore
//! let planner = ShardPlanner::new(registry, health, snapshots, RoutingPolicy::default());
//! let plan = planner.plan(&SiteRequest::new("site-42").with_niche("travel")).await?;
//! for shard in &plan.shards {
//!     println!("{} ({})", shard.shard_key(), shard.strategy);
//! }
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod planner;
pub mod policy;
pub mod scorer;

pub use error::{Result, RoutingError};
pub use planner::{
    environment_credentials, plan_candidates, ShardPlan, ShardPlanner, SiteRequest,
    ENVIRONMENT_SHARD_KEY,
};
pub use policy::{
    clamp_max_fallbacks, clamp_target_domains, parse_region_list, parse_region_matrix,
    RoutingPolicy, DEFAULT_MAX_FALLBACKS, MAX_FALLBACKS_LIMIT, MAX_TARGET_DOMAINS,
};
pub use scorer::{rank, HealthView, RankOutcome, ScoreBreakdown, ScoredCandidate, SiteKey};
