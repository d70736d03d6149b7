//! Assignment snapshots
//!
//! The router balances load and topical niches using a periodically
//! refreshed count of live sites per account. Counting is a table scan, so
//! the aggregate is cached for a short TTL and keyed by a fingerprint of the
//! candidate set: adding or removing a shard invalidates it immediately.

use crate::error::{RegistryError, Result};
use crate::registry::DEFAULT_LOOKUP_TIMEOUT;
use async_trait::async_trait;
use shardline_types::{AccountId, ShardAssignmentSnapshot, ShardCandidate, SiteAssignment, TtlCache};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default lifetime of an assignment snapshot.
pub const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(30);

/// Read access to live site-to-account assignments.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Live assignments whose account is one of `account_ids`.
    async fn list_live_assignments(&self, account_ids: &[AccountId]) -> Result<Vec<SiteAssignment>>;
}

/// Stable fingerprint of a candidate set's membership.
///
/// Order-insensitive; only (shard key, account) identities contribute.
pub fn candidate_fingerprint(candidates: &[ShardCandidate]) -> String {
    let mut identities: Vec<String> = candidates
        .iter()
        .map(|c| format!("{}|{}", c.shard_key, c.account_id))
        .collect();
    identities.sort();
    identities.dedup();

    let mut hasher = blake3::Hasher::new();
    for identity in &identities {
        hasher.update(identity.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}

/// TTL cache over [`ShardAssignmentSnapshot`]s.
pub struct AssignmentSnapshotCache {
    store: Arc<dyn AssignmentStore>,
    cache: TtlCache<String, ShardAssignmentSnapshot>,
}

impl AssignmentSnapshotCache {
    pub fn new(store: Arc<dyn AssignmentStore>) -> Self {
        Self::with_ttl(store, DEFAULT_SNAPSHOT_TTL)
    }

    pub fn with_ttl(store: Arc<dyn AssignmentStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: TtlCache::new(ttl),
        }
    }

    /// The snapshot for `candidates`, rebuilt when expired or when the
    /// candidate membership changed.
    pub async fn snapshot(&self, candidates: &[ShardCandidate]) -> Result<Arc<ShardAssignmentSnapshot>> {
        let fingerprint = candidate_fingerprint(candidates);
        self.cache
            .get_or_try_load(fingerprint, move || self.build(candidates))
            .await
    }

    pub async fn invalidate(&self) {
        self.cache.invalidate().await;
    }

    async fn build(&self, candidates: &[ShardCandidate]) -> Result<ShardAssignmentSnapshot> {
        let mut account_ids: Vec<AccountId> = candidates.iter().map(|c| c.account_id.clone()).collect();
        account_ids.sort();
        account_ids.dedup();

        let assignments = tokio::time::timeout(
            DEFAULT_LOOKUP_TIMEOUT,
            self.store.list_live_assignments(&account_ids),
        )
        .await
        .map_err(|_| RegistryError::Timeout {
            operation: "assignment listing",
            after: DEFAULT_LOOKUP_TIMEOUT,
        })??;
        let snapshot = ShardAssignmentSnapshot::from_assignments(&assignments);

        debug!(
            accounts = account_ids.len(),
            assigned = snapshot.total_assigned,
            niches = snapshot.total_by_niche.len(),
            "Assignment snapshot rebuilt"
        );

        Ok(snapshot)
    }
}
