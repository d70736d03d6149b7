//! Shard health store
//!
//! Concurrent map of (shard key, account) → [`ShardHealthState`]. Updates
//! hold the map's entry lock while computing the replacement record and then
//! swap the whole value, so concurrent writers to the same shard serialize
//! and readers never see a half-applied transition.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shardline_types::{ShardHealthState, ShardIdentity, ShardOutcome, TtlCache};
use tracing::{debug, info, instrument, warn};

use crate::breaker;
use crate::config::HealthConfig;
use crate::error::{HealthError, HealthResult};
use crate::persistence::{HealthPersistence, HealthUpsert, HealthWriteBehind, WriteBehindStats};

/// In-memory circuit breaker state for every shard.
pub struct ShardHealthStore {
    config: HealthConfig,
    entries: DashMap<ShardIdentity, ShardHealthState>,
    persistence: Option<Arc<dyn HealthPersistence>>,
    writer: Option<HealthWriteBehind>,
    reload_gate: TtlCache<(), usize>,
}

impl ShardHealthStore {
    /// A memory-only store.
    pub fn new(config: HealthConfig) -> Self {
        let reload_interval = config.reload_interval;
        Self {
            config,
            entries: DashMap::new(),
            persistence: None,
            writer: None,
            reload_gate: TtlCache::new(reload_interval),
        }
    }

    /// A store mirrored to `persistence` through a write-behind task.
    ///
    /// Must be called within a tokio runtime.
    pub fn with_persistence(config: HealthConfig, persistence: Arc<dyn HealthPersistence>) -> Self {
        let mut store = Self::new(config);
        store.writer = Some(HealthWriteBehind::spawn(Arc::clone(&persistence)));
        store.persistence = Some(persistence);
        store
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Number of entries currently held, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, identity: &ShardIdentity) -> Option<ShardHealthState> {
        self.get_at(identity, Utc::now())
    }

    /// The live record for `identity`; a stale record is purged and `None`
    /// returned.
    pub fn get_at(&self, identity: &ShardIdentity, now: DateTime<Utc>) -> Option<ShardHealthState> {
        let state = self.entries.get(identity).map(|e| e.value().clone())?;
        if self.is_stale(&state, now) {
            self.entries.remove_if(identity, |_, s| self.is_stale(s, now));
            debug!(shard = %identity, "Stale health entry purged");
            return None;
        }
        Some(state)
    }

    pub fn record_outcome(&self, identity: &ShardIdentity, outcome: ShardOutcome) -> ShardHealthState {
        self.record_outcome_at(identity, outcome, Utc::now())
    }

    /// Apply `outcome` to the shard's record and queue the durable write.
    pub fn record_outcome_at(
        &self,
        identity: &ShardIdentity,
        outcome: ShardOutcome,
        now: DateTime<Utc>,
    ) -> ShardHealthState {
        let next = {
            let mut entry = self
                .entries
                .entry(identity.clone())
                .or_insert_with(|| ShardHealthState::fresh(now));
            let current = (!self.is_stale(entry.value(), now)).then(|| entry.value().clone());
            let next = breaker::apply_outcome(current.as_ref(), outcome, now, &self.config);
            *entry.value_mut() = next.clone();
            next
        };

        match outcome {
            ShardOutcome::Success => debug!(
                shard = %identity,
                penalty = next.penalty,
                "Shard outcome recorded"
            ),
            _ => warn!(
                shard = %identity,
                outcome = %outcome,
                penalty = next.penalty,
                cooldown_until = ?next.cooldown_until,
                "Shard penalized"
            ),
        }

        if let Some(writer) = &self.writer {
            writer.enqueue(HealthUpsert::for_outcome(identity.clone(), outcome, &next));
        }

        next
    }

    pub fn is_cooling_down(&self, identity: &ShardIdentity) -> bool {
        self.is_cooling_down_at(identity, Utc::now())
    }

    pub fn is_cooling_down_at(&self, identity: &ShardIdentity, now: DateTime<Utc>) -> bool {
        self.get_at(identity, now)
            .is_some_and(|state| state.is_cooling_down(now))
    }

    pub fn health_multiplier(&self, identity: &ShardIdentity) -> f64 {
        self.health_multiplier_at(identity, Utc::now())
    }

    pub fn health_multiplier_at(&self, identity: &ShardIdentity, now: DateTime<Utc>) -> f64 {
        breaker::health_multiplier(self.get_at(identity, now).as_ref(), now, &self.config)
    }

    pub fn snapshot(&self) -> HashMap<ShardIdentity, ShardHealthState> {
        self.snapshot_at(Utc::now())
    }

    /// Every live record, keyed by shard. Stale records are purged.
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> HashMap<ShardIdentity, ShardHealthState> {
        let mut live = HashMap::new();
        let mut stale = Vec::new();
        for entry in self.entries.iter() {
            if self.is_stale(entry.value(), now) {
                stale.push(entry.key().clone());
            } else {
                live.insert(entry.key().clone(), entry.value().clone());
            }
        }
        for identity in stale {
            self.entries.remove_if(&identity, |_, s| self.is_stale(s, now));
        }
        live
    }

    /// Drop every stale record, returning how many were removed.
    pub fn purge_stale(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, state| !self.is_stale(state, now));
        before.saturating_sub(self.entries.len())
    }

    /// Merge persisted records into memory; the newer `updated_at` wins.
    #[instrument(skip(self, persistence))]
    pub async fn reload_from(&self, persistence: &dyn HealthPersistence) -> HealthResult<usize> {
        let rows = persistence.load_all().await?;
        let now = Utc::now();
        let mut merged = 0;

        for (identity, persisted) in rows {
            if self.is_stale(&persisted, now) {
                continue;
            }
            match self.entries.entry(identity) {
                Entry::Occupied(mut occupied) => {
                    if persisted.updated_at > occupied.get().updated_at {
                        occupied.insert(persisted);
                        merged += 1;
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(persisted);
                    merged += 1;
                }
            }
        }

        debug!(merged, "Health records reloaded");
        Ok(merged)
    }

    /// Reload from the configured persistence at most once per reload
    /// interval. Concurrent callers share one in-flight reload; a failed
    /// reload is logged and keeps the in-memory view.
    pub async fn ensure_reloaded(&self) {
        let Some(persistence) = self.persistence.as_deref() else {
            return;
        };
        let reloaded = self
            .reload_gate
            .get_or_try_load((), move || async move {
                let merged = match self.reload_from(persistence).await {
                    Ok(merged) => merged,
                    Err(e) => {
                        warn!(error = %e, "Health reload failed; using in-memory state");
                        0
                    }
                };
                Ok::<usize, HealthError>(merged)
            })
            .await;
        if let Ok(merged) = reloaded {
            if *merged > 0 {
                info!(merged = *merged, "Health state refreshed from storage");
            }
        }
    }

    /// Wait for queued durable writes to be attempted.
    pub async fn flush_persistence(&self) {
        if let Some(writer) = &self.writer {
            writer.flush().await;
        }
    }

    /// Write-behind counters; `None` for a memory-only store.
    pub fn write_stats(&self) -> Option<WriteBehindStats> {
        self.writer.as_ref().map(HealthWriteBehind::stats)
    }

    fn is_stale(&self, state: &ShardHealthState, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(state.updated_at)
            .to_std()
            .is_ok_and(|age| age > self.config.stale_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryHealthPersistence;
    use shardline_types::{AccountId, ShardKey};
    use std::time::Duration;

    fn shard(key: &str) -> ShardIdentity {
        ShardIdentity::new(ShardKey::new(key), AccountId::new("acct"))
    }

    #[test]
    fn test_rate_limit_cools_shard_down() {
        let store = ShardHealthStore::new(HealthConfig::default());
        let now = Utc::now();
        let east = shard("east");

        assert_eq!(store.health_multiplier_at(&east, now), 1.0);
        store.record_outcome_at(&east, ShardOutcome::RateLimited, now);

        assert!(store.is_cooling_down_at(&east, now));
        assert_eq!(store.health_multiplier_at(&east, now), 0.05);

        let later = now + chrono::Duration::seconds(31);
        assert!(!store.is_cooling_down_at(&east, later));
        assert!((store.health_multiplier_at(&east, later) - 0.82).abs() < 1e-9);
        assert!(store.write_stats().is_none());
    }

    #[test]
    fn test_stale_entries_purged_on_read() {
        let store = ShardHealthStore::new(HealthConfig::default());
        let now = Utc::now();
        store.record_outcome_at(&shard("east"), ShardOutcome::Failure, now);
        store.record_outcome_at(&shard("west"), ShardOutcome::Failure, now);

        let much_later = now + chrono::Duration::minutes(31);
        assert!(store.get_at(&shard("east"), much_later).is_none());
        assert_eq!(store.len(), 1);

        assert!(store.snapshot_at(much_later).is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_stale_record_restarts_from_scratch() {
        let store = ShardHealthStore::new(HealthConfig::default());
        let now = Utc::now();
        let east = shard("east");
        store.record_outcome_at(&east, ShardOutcome::RateLimited, now);

        let much_later = now + chrono::Duration::minutes(45);
        let state = store.record_outcome_at(&east, ShardOutcome::Success, much_later);
        assert_eq!(state.rate_limit_count, 0);
        assert_eq!(state.success_count, 1);
    }

    #[test]
    fn test_purge_stale_counts_removals() {
        let store = ShardHealthStore::new(HealthConfig::default());
        let now = Utc::now();
        store.record_outcome_at(&shard("a"), ShardOutcome::Success, now - chrono::Duration::hours(1));
        store.record_outcome_at(&shard("b"), ShardOutcome::Success, now);
        assert_eq!(store.purge_stale(now), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_outcomes_are_not_lost() {
        let store = Arc::new(ShardHealthStore::new(HealthConfig::default()));
        let east = shard("east");

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let store = Arc::clone(&store);
                let east = east.clone();
                tokio::spawn(async move {
                    let outcome = if i % 2 == 0 {
                        ShardOutcome::Success
                    } else {
                        ShardOutcome::Failure
                    };
                    store.record_outcome(&east, outcome);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let state = store.get(&east).unwrap();
        assert_eq!(state.success_count, 16);
        assert_eq!(state.failure_count, 16);
        assert!(state.penalty <= shardline_types::MAX_PENALTY);
    }

    #[tokio::test]
    async fn test_outcomes_are_written_behind() {
        let persistence = Arc::new(InMemoryHealthPersistence::new());
        let store = ShardHealthStore::with_persistence(HealthConfig::default(), persistence.clone());
        let east = shard("east");

        store.record_outcome(&east, ShardOutcome::RateLimited);
        store.record_outcome(&east, ShardOutcome::Success);
        store.flush_persistence().await;

        let row = persistence.get(&east).unwrap();
        assert_eq!(row.rate_limit_count, 1);
        assert_eq!(row.success_count, 1);
        assert_eq!(row.penalty, 1);
        assert_eq!(store.write_stats().unwrap().attempted, 2);
    }

    #[tokio::test]
    async fn test_persistence_failure_never_blocks_routing() {
        let persistence = Arc::new(InMemoryHealthPersistence::new());
        persistence.set_fail_writes(true);
        let store = ShardHealthStore::with_persistence(HealthConfig::default(), persistence.clone());
        let east = shard("east");

        store.record_outcome(&east, ShardOutcome::RateLimited);
        store.flush_persistence().await;

        assert!(store.is_cooling_down(&east));
        let stats = store.write_stats().unwrap();
        assert_eq!(stats.attempted, 1);
        assert_eq!(stats.failed, 1);
        assert!(persistence.get(&east).is_none());
    }

    #[tokio::test]
    async fn test_reload_keeps_newest_record() {
        let persistence = InMemoryHealthPersistence::new();
        let store = ShardHealthStore::new(HealthConfig::default());
        let now = Utc::now();

        // Memory is newer for east, storage is newer for west.
        store.record_outcome_at(&shard("east"), ShardOutcome::Failure, now);
        let mut older = ShardHealthState::fresh(now - chrono::Duration::seconds(10));
        older.penalty = 5;
        persistence.put(shard("east"), older);

        store.record_outcome_at(&shard("west"), ShardOutcome::Success, now - chrono::Duration::seconds(10));
        let mut newer = ShardHealthState::fresh(now);
        newer.penalty = 3;
        newer.failure_count = 7;
        persistence.put(shard("west"), newer.clone());

        let mut unseen = ShardHealthState::fresh(now);
        unseen.penalty = 2;
        persistence.put(shard("north"), unseen);

        let merged = store.reload_from(&persistence).await.unwrap();
        assert_eq!(merged, 2);
        assert_eq!(store.get(&shard("east")).unwrap().penalty, 1);
        assert_eq!(store.get(&shard("west")).unwrap(), newer);
        assert_eq!(store.get(&shard("north")).unwrap().penalty, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_is_throttled() {
        let persistence = Arc::new(InMemoryHealthPersistence::new());
        let config = HealthConfig::default().with_reload_interval(Duration::from_secs(60));
        let store = Arc::new(ShardHealthStore::with_persistence(config, persistence.clone()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.ensure_reloaded().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(persistence.load_count(), 1);

        store.ensure_reloaded().await;
        assert_eq!(persistence.load_count(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        store.ensure_reloaded().await;
        assert_eq!(persistence.load_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reload_still_waits_for_interval() {
        let persistence = Arc::new(InMemoryHealthPersistence::new());
        persistence.set_fail_loads(true);
        let store = ShardHealthStore::with_persistence(HealthConfig::default(), persistence.clone());

        store.ensure_reloaded().await;
        store.ensure_reloaded().await;
        assert_eq!(persistence.load_count(), 1);
    }
}
