//! Routing plan entries

use crate::candidate::ShardCandidate;
use crate::ids::{AccountId, ShardIdentity, ShardKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a shard ended up at its position in the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// Pinned by a per-site override.
    DomainOverride,
    /// Placed by weighted hash-bucket ranking.
    HashBucket,
    /// The single environment-level account, used when no pool exists.
    Default,
}

impl fmt::Display for AssignmentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AssignmentStrategy::DomainOverride => "domain_override",
            AssignmentStrategy::HashBucket => "hash_bucket",
            AssignmentStrategy::Default => "default",
        })
    }
}

/// Where the shard's credentials came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardSource {
    ExplicitOverride,
    ResolvedReference,
    EnvironmentFallback,
}

impl fmt::Display for ShardSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShardSource::ExplicitOverride => "explicit_override",
            ShardSource::ResolvedReference => "resolved_reference",
            ShardSource::EnvironmentFallback => "environment_fallback",
        })
    }
}

/// Client options handed to the hosting-provider client.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub account_id: AccountId,
    pub api_token: String,
}

impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("account_id", &self.account_id)
            .field("api_token", &"<redacted>")
            .finish()
    }
}

/// A shard placed in a routing plan.
#[derive(Debug, Clone)]
pub struct RankedShard {
    pub candidate: ShardCandidate,
    pub credentials: ProviderCredentials,
    pub strategy: AssignmentStrategy,
    pub source: ShardSource,
    /// Final ranking score; `None` for shards placed without scoring.
    pub score: Option<f64>,
    /// Non-fatal notes produced while ranking this shard.
    pub warnings: Vec<String>,
}

impl RankedShard {
    pub fn new(candidate: ShardCandidate, strategy: AssignmentStrategy, source: ShardSource) -> Self {
        let credentials = ProviderCredentials {
            account_id: candidate.account_id.clone(),
            api_token: candidate.credential.clone(),
        };
        Self {
            candidate,
            credentials,
            strategy,
            source,
            score: None,
            warnings: Vec::new(),
        }
    }

    pub fn shard_key(&self) -> &ShardKey {
        &self.candidate.shard_key
    }

    pub fn account_id(&self) -> &AccountId {
        &self.candidate.account_id
    }

    pub fn identity(&self) -> ShardIdentity {
        self.candidate.identity()
    }
}
