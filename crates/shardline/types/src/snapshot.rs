//! Assignment snapshots - how many live sites each account currently serves

use crate::ids::{AccountId, DomainId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One live site-to-account assignment read from the domain table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteAssignment {
    pub domain_id: DomainId,
    pub account_id: AccountId,
    /// Topical category, already normalized by the caller (lowercase).
    pub niche: Option<String>,
}

/// Point-in-time aggregate over live assignments.
///
/// Ordered maps keep iteration deterministic for ranking and for tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignmentSnapshot {
    pub total_by_account_id: BTreeMap<AccountId, u64>,
    pub niche_by_account_id: BTreeMap<AccountId, BTreeMap<String, u64>>,
    pub total_by_niche: BTreeMap<String, u64>,
    pub total_assigned: u64,
}

impl ShardAssignmentSnapshot {
    pub fn from_assignments<'a>(assignments: impl IntoIterator<Item = &'a SiteAssignment>) -> Self {
        let mut snapshot = Self::default();
        for assignment in assignments {
            snapshot.record(&assignment.account_id, assignment.niche.as_deref());
        }
        snapshot
    }

    /// Count one more site on `account_id`.
    pub fn record(&mut self, account_id: &AccountId, niche: Option<&str>) {
        *self
            .total_by_account_id
            .entry(account_id.clone())
            .or_default() += 1;
        self.total_assigned += 1;

        if let Some(niche) = niche.map(str::trim).filter(|n| !n.is_empty()) {
            let niche = niche.to_lowercase();
            *self
                .niche_by_account_id
                .entry(account_id.clone())
                .or_default()
                .entry(niche.clone())
                .or_default() += 1;
            *self.total_by_niche.entry(niche).or_default() += 1;
        }
    }

    pub fn assigned_to(&self, account_id: &AccountId) -> u64 {
        self.total_by_account_id
            .get(account_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn niche_count(&self, account_id: &AccountId, niche: &str) -> u64 {
        self.niche_by_account_id
            .get(account_id)
            .and_then(|by_niche| by_niche.get(niche))
            .copied()
            .unwrap_or(0)
    }

    pub fn niche_total(&self, niche: &str) -> u64 {
        self.total_by_niche.get(niche).copied().unwrap_or(0)
    }
}
