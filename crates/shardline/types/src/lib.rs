//! Shardline Types - Core data model for shard assignment and deployment
//!
//! This crate defines the vocabulary shared by every Shardline component:
//!
//! - **Identifiers**: [`ShardKey`], [`AccountId`], [`ConnectionId`], [`JobId`], [`DomainId`]
//! - **Shards**: [`ShardCandidate`] (an eligible upstream account) and
//!   [`RankedShard`] (a candidate placed in a routing plan)
//! - **Health**: [`ShardHealthState`] and [`ShardOutcome`]
//! - **Load**: [`ShardAssignmentSnapshot`]
//! - **Jobs**: [`DeployStep`], [`StepStatus`], [`JobStatus`]
//! - **Caching**: [`cache::TtlCache`], a TTL cache with single-flight loading

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod cache;
pub mod candidate;
pub mod health;
pub mod ids;
pub mod job;
pub mod plan;
pub mod region;
pub mod snapshot;

pub use cache::TtlCache;
pub use candidate::{ShardCandidate, DEFAULT_BASE_WEIGHT, MAX_BASE_WEIGHT};
pub use health::{ShardHealthState, ShardOutcome, MAX_PENALTY};
pub use ids::{AccountId, ConnectionId, DomainId, JobId, ShardIdentity, ShardKey};
pub use job::{DeployStep, JobStatus, StepName, StepStatus};
pub use plan::{AssignmentStrategy, ProviderCredentials, RankedShard, ShardSource};
pub use region::{normalize_region, Region};
pub use snapshot::{ShardAssignmentSnapshot, SiteAssignment};
