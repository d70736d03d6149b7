//! Durable health storage and the write-behind queue in front of it.

#[cfg(feature = "postgres")]
pub mod postgres;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use shardline_types::{ShardHealthState, ShardIdentity, ShardOutcome};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{HealthError, HealthResult};

/// One durable write: counters are deltas, everything else replaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthUpsert {
    pub identity: ShardIdentity,
    pub penalty: u8,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_outcome: Option<ShardOutcome>,
    pub success_delta: u64,
    pub rate_limit_delta: u64,
    pub failure_delta: u64,
    pub updated_at: DateTime<Utc>,
}

impl HealthUpsert {
    /// The write describing `outcome` having produced `state`.
    pub fn for_outcome(identity: ShardIdentity, outcome: ShardOutcome, state: &ShardHealthState) -> Self {
        Self {
            identity,
            penalty: state.penalty,
            cooldown_until: state.cooldown_until,
            last_outcome: state.last_outcome,
            success_delta: u64::from(outcome == ShardOutcome::Success),
            rate_limit_delta: u64::from(outcome == ShardOutcome::RateLimited),
            failure_delta: u64::from(outcome == ShardOutcome::Failure),
            updated_at: state.updated_at,
        }
    }

    /// Merge this write into an existing row (or create one).
    pub fn apply_to(&self, existing: Option<&ShardHealthState>) -> ShardHealthState {
        let mut row = existing
            .cloned()
            .unwrap_or_else(|| ShardHealthState::fresh(self.updated_at));
        row.penalty = self.penalty;
        row.cooldown_until = self.cooldown_until;
        row.last_outcome = self.last_outcome;
        row.success_count = row.success_count.saturating_add(self.success_delta);
        row.rate_limit_count = row.rate_limit_count.saturating_add(self.rate_limit_delta);
        row.failure_count = row.failure_count.saturating_add(self.failure_delta);
        row.updated_at = self.updated_at;
        row
    }
}

/// Durable storage for shard health.
#[async_trait]
pub trait HealthPersistence: Send + Sync {
    /// Upsert by (shard key, account).
    async fn upsert(&self, upsert: &HealthUpsert) -> HealthResult<()>;

    /// Every persisted record.
    async fn load_all(&self) -> HealthResult<Vec<(ShardIdentity, ShardHealthState)>>;
}

/// In-memory health persistence
///
/// Stands in for the database in tests and single-process setups. Writes
/// and loads can be made to fail to exercise the best-effort paths.
pub struct InMemoryHealthPersistence {
    rows: DashMap<ShardIdentity, ShardHealthState>,
    fail_writes: AtomicBool,
    fail_loads: AtomicBool,
    stall_writes: AtomicBool,
    upserts: AtomicU64,
    loads: AtomicU64,
}

impl InMemoryHealthPersistence {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            fail_writes: AtomicBool::new(false),
            fail_loads: AtomicBool::new(false),
            stall_writes: AtomicBool::new(false),
            upserts: AtomicU64::new(0),
            loads: AtomicU64::new(0),
        }
    }

    /// Seed or overwrite a row directly, as another process would.
    pub fn put(&self, identity: ShardIdentity, state: ShardHealthState) {
        self.rows.insert(identity, state);
    }

    pub fn get(&self, identity: &ShardIdentity) -> Option<ShardHealthState> {
        self.rows.get(identity).map(|r| r.value().clone())
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Make writes hang, as a locked or unreachable database would.
    pub fn set_stall_writes(&self, stall: bool) {
        self.stall_writes.store(stall, Ordering::SeqCst);
    }

    /// Successful upserts applied so far.
    pub fn upsert_count(&self) -> u64 {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryHealthPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthPersistence for InMemoryHealthPersistence {
    async fn upsert(&self, upsert: &HealthUpsert) -> HealthResult<()> {
        if self.stall_writes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(HealthError::Persistence("write rejected".into()));
        }
        let mut entry = self
            .rows
            .entry(upsert.identity.clone())
            .or_insert_with(|| ShardHealthState::fresh(upsert.updated_at));
        let merged = upsert.apply_to(Some(entry.value()));
        *entry = merged;
        drop(entry);
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_all(&self) -> HealthResult<Vec<(ShardIdentity, ShardHealthState)>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(HealthError::Persistence("read rejected".into()));
        }
        let mut rows: Vec<_> = self
            .rows
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }
}

/// Writes that can wait in the queue before new ones are dropped.
pub const WRITE_QUEUE_CAPACITY: usize = 1024;

/// Deadline for a single durable write.
pub const UPSERT_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters of the write-behind queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBehindStats {
    /// Writes accepted into the queue.
    pub enqueued: u64,
    pub attempted: u64,
    /// Attempted writes that errored or timed out.
    pub failed: u64,
    /// Writes rejected because the queue was full or the writer had stopped.
    pub dropped: u64,
}

#[derive(Default)]
struct StatCounters {
    enqueued: AtomicU64,
    attempted: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

enum WriteCommand {
    Upsert(HealthUpsert),
    Flush(oneshot::Sender<()>),
}

/// Handle to a background task that drains health writes in order.
///
/// Enqueueing never blocks and never fails the caller: when the queue is
/// full the write is dropped and counted. Each write is bounded by a
/// timeout. The task exits once every handle clone is dropped.
#[derive(Clone)]
pub struct HealthWriteBehind {
    tx: mpsc::Sender<WriteCommand>,
    stats: Arc<StatCounters>,
}

impl HealthWriteBehind {
    /// Spawn the writer task with the default queue size and write deadline.
    /// Must be called within a tokio runtime.
    pub fn spawn(persistence: Arc<dyn HealthPersistence>) -> Self {
        Self::spawn_with(persistence, WRITE_QUEUE_CAPACITY, UPSERT_TIMEOUT)
    }

    pub fn spawn_with(
        persistence: Arc<dyn HealthPersistence>,
        capacity: usize,
        upsert_timeout: Duration,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriteCommand>(capacity.max(1));
        let stats = Arc::new(StatCounters::default());
        let task_stats = Arc::clone(&stats);

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    WriteCommand::Upsert(upsert) => {
                        task_stats.attempted.fetch_add(1, Ordering::SeqCst);
                        match tokio::time::timeout(upsert_timeout, persistence.upsert(&upsert)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                task_stats.failed.fetch_add(1, Ordering::SeqCst);
                                warn!(
                                    shard = %upsert.identity,
                                    error = %e,
                                    "Health write failed; in-memory state kept"
                                );
                            }
                            Err(_) => {
                                task_stats.failed.fetch_add(1, Ordering::SeqCst);
                                warn!(
                                    shard = %upsert.identity,
                                    timeout_ms = upsert_timeout.as_millis() as u64,
                                    "Health write timed out; in-memory state kept"
                                );
                            }
                        }
                    }
                    WriteCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Health write-behind drained");
        });

        Self { tx, stats }
    }

    /// Queue a write, dropping it if the queue is full.
    pub fn enqueue(&self, upsert: HealthUpsert) {
        match self.tx.try_send(WriteCommand::Upsert(upsert)) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::SeqCst);
            }
            Err(TrySendError::Full(WriteCommand::Upsert(upsert))) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(shard = %upsert.identity, dropped, "Health write queue full; write dropped");
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::SeqCst);
                warn!("Health writer has stopped; write dropped");
            }
        }
    }

    /// Wait until every write queued before this call has been attempted.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(WriteCommand::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    pub fn stats(&self) -> WriteBehindStats {
        WriteBehindStats {
            enqueued: self.stats.enqueued.load(Ordering::SeqCst),
            attempted: self.stats.attempted.load(Ordering::SeqCst),
            failed: self.stats.failed.load(Ordering::SeqCst),
            dropped: self.stats.dropped.load(Ordering::SeqCst),
        }
    }
}
