//! Shard candidates - eligible upstream accounts

use crate::ids::{AccountId, ConnectionId, ShardIdentity, ShardKey};
use crate::region::Region;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capacity hint applied when a connection does not configure one.
pub const DEFAULT_BASE_WEIGHT: u32 = 100;

/// Upper bound for operator-configured weights.
pub const MAX_BASE_WEIGHT: u32 = 10_000;

/// One eligible upstream account available for assignment.
///
/// Built by the registry from a connection record and never mutated
/// afterwards; a registry refresh replaces the whole set.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCandidate {
    pub connection_id: ConnectionId,
    pub shard_key: ShardKey,
    pub account_id: AccountId,
    /// Decrypted API token. Redacted from `Debug` output.
    pub credential: String,
    pub region: Option<Region>,
    pub base_weight: u32,
}

impl ShardCandidate {
    pub fn identity(&self) -> ShardIdentity {
        ShardIdentity::new(self.shard_key.clone(), self.account_id.clone())
    }

    /// Clamp an operator-supplied weight into `[1, MAX_BASE_WEIGHT]`,
    /// defaulting when absent or non-positive.
    pub fn clamp_weight(raw: Option<i64>) -> u32 {
        match raw {
            Some(w) if w > 0 => w.min(i64::from(MAX_BASE_WEIGHT)) as u32,
            _ => DEFAULT_BASE_WEIGHT,
        }
    }
}

impl fmt::Debug for ShardCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardCandidate")
            .field("connection_id", &self.connection_id)
            .field("shard_key", &self.shard_key)
            .field("account_id", &self.account_id)
            .field("credential", &"<redacted>")
            .field("region", &self.region)
            .field("base_weight", &self.base_weight)
            .finish()
    }
}
