//! Deploy Worker - Concurrent job execution
//!
//! Claims queued jobs and runs one pipeline task per job, bounded by a
//! semaphore. Jobs share the health store and routing caches through the
//! orchestrator; each owns its own context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use shardline_types::JobId;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use crate::context::CancellationFlag;
use crate::error::{DeployError, Result};
use crate::orchestrator::{DeployReport, Orchestrator};
use crate::store::JobStore;

/// Default pause between polls of an empty queue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Runs deployment jobs from a [`JobStore`].
pub struct DeployWorker {
    orchestrator: Arc<Orchestrator>,
    jobs: Arc<dyn JobStore>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    cancellations: Arc<DashMap<JobId, CancellationFlag>>,
    shutdown: AtomicBool,
    wake: Notify,
    poll_interval: Duration,
}

impl DeployWorker {
    pub fn new(orchestrator: Arc<Orchestrator>, jobs: Arc<dyn JobStore>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            orchestrator,
            jobs,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            cancellations: Arc::new(DashMap::new()),
            shutdown: AtomicBool::new(false),
            wake: Notify::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.cancellations.len()
    }

    /// Ask a running job to stop before its next step.
    ///
    /// Returns false when the job is not running on this worker.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        match self.cancellations.get(job_id) {
            Some(flag) => {
                flag.cancel();
                info!(job_id = %job_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Stop claiming new jobs; running jobs finish normally.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Claim up to `max_concurrent` jobs, run them concurrently and wait for
    /// all of them.
    ///
    /// A claim error is returned only when nothing was claimed; otherwise
    /// it is logged and the reports of the jobs already running are kept.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<Vec<DeployReport>> {
        let mut handles = Vec::new();

        while !self.is_shutting_down() {
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| DeployError::Worker(e.to_string()))?;

            let claimed = match self.jobs.claim_next().await {
                Ok(claimed) => claimed,
                // Jobs already spawned still finish and report.
                Err(e) if !handles.is_empty() => {
                    warn!(error = %e, running = handles.len(), "Claim failed; finishing claimed jobs");
                    break;
                }
                Err(e) => return Err(e),
            };
            let Some(job) = claimed else {
                drop(permit);
                break;
            };

            let flag = CancellationFlag::new();
            self.cancellations.insert(job.id.clone(), flag.clone());

            let orchestrator = self.orchestrator.clone();
            let cancellations = self.cancellations.clone();
            let job_id = job.id.clone();
            debug!(job_id = %job_id, "Claimed job");

            handles.push(tokio::spawn(async move {
                let report = orchestrator.run(job, flag).await;
                cancellations.remove(&job_id);
                drop(permit);
                report
            }));

            if handles.len() >= self.max_concurrent {
                break;
            }
        }

        let mut reports = Vec::with_capacity(handles.len());
        for joined in join_all(handles).await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "Deploy task panicked"),
            }
        }
        Ok(reports)
    }

    /// Process jobs until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) {
        info!(max_concurrent = self.max_concurrent, "Deploy worker started");

        while !self.is_shutting_down() {
            match self.run_once().await {
                Ok(reports) if !reports.is_empty() => {
                    let failed = reports.iter().filter(|r| !r.succeeded()).count();
                    info!(jobs = reports.len(), failed, "Batch finished");
                    continue;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to claim jobs"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.wake.notified() => {}
            }
        }

        info!("Deploy worker stopped");
    }
}
