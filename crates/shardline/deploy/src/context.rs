//! Deploy Context - Per-job mutable state
//!
//! One context is created per job run and threaded through the pipeline. It
//! owns the step trace, the shard plan, the active shard and the artifacts
//! produced so far; nothing in it is shared with other jobs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shardline_types::{
    DeployStep, DomainId, JobId, JobStatus, RankedShard, ShardIdentity, ShardOutcome, StepName,
    StepStatus,
};

use crate::best_effort::SideEffect;
use crate::provider::{ProviderProject, SiteFile};
use crate::store::{DeployJob, DeployPayload, DomainRecord};

/// Longest project name the hosting provider accepts.
pub const MAX_PROJECT_NAME_LEN: usize = 58;

/// Cooperative cancellation, checked between pipeline steps.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Derive a provider-safe project name.
///
/// Lowercase ASCII alphanumerics separated by single dashes, at most
/// [`MAX_PROJECT_NAME_LEN`] characters; `site-<domain id>` when nothing
/// usable remains.
pub fn sanitize_project_name(raw: &str, domain_id: &DomainId) -> String {
    let slug = slugify(raw);
    if !slug.is_empty() {
        return slug;
    }
    let fallback = slugify(&format!("site-{}", domain_id.as_str()));
    if fallback == "site" || fallback.is_empty() {
        "site".to_string()
    } else {
        fallback
    }
}

fn slugify(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(MAX_PROJECT_NAME_LEN));
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            if out.len() == MAX_PROJECT_NAME_LEN {
                break;
            }
            out.push(ch.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            if out.len() == MAX_PROJECT_NAME_LEN {
                break;
            }
            out.push('-');
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// One attempt of a step against one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAttempt {
    pub step: StepName,
    pub shard: ShardIdentity,
    pub outcome: ShardOutcome,
    pub error: Option<String>,
}

/// Mutable state of one job run.
pub struct DeployContext {
    pub job_id: JobId,
    pub domain: DomainRecord,
    pub payload: DeployPayload,
    pub attempts: u32,
    pub status: JobStatus,
    pub steps: Vec<DeployStep>,
    pub project_name: String,
    pub plan: Vec<RankedShard>,
    active: Option<usize>,
    pub project: Option<ProviderProject>,
    pub files: Vec<SiteFile>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub shard_attempts: Vec<ShardAttempt>,
    pub side_effects: Vec<SideEffect>,
}

impl DeployContext {
    pub fn new(job: DeployJob, domain: DomainRecord) -> Self {
        let requested = job
            .payload
            .project_name
            .clone()
            .unwrap_or_else(|| domain.hostname.clone());
        let project_name = sanitize_project_name(&requested, &domain.id);

        Self {
            job_id: job.id,
            domain,
            payload: job.payload,
            attempts: job.attempts + 1,
            status: JobStatus::Processing,
            steps: DeployStep::initial_trace(),
            project_name,
            plan: Vec::new(),
            active: None,
            project: None,
            files: Vec::new(),
            error: None,
            warnings: Vec::new(),
            shard_attempts: Vec::new(),
            side_effects: Vec::new(),
        }
    }

    pub fn step(&self, name: StepName) -> Option<&DeployStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn start_step(&mut self, name: StepName) {
        self.set_step(name, StepStatus::Running, None);
    }

    pub fn complete_step(&mut self, name: StepName, detail: impl Into<String>) {
        self.set_step(name, StepStatus::Done, Some(detail.into()));
    }

    /// Resolve a step as done without running it.
    pub fn skip_step(&mut self, name: StepName, reason: &str) {
        self.set_step(name, StepStatus::Done, Some(format!("Skipped: {reason}")));
    }

    pub fn fail_step(&mut self, name: StepName, detail: impl Into<String>) {
        self.set_step(name, StepStatus::Failed, Some(detail.into()));
    }

    fn set_step(&mut self, name: StepName, status: StepStatus, detail: Option<String>) {
        if let Some(step) = self.steps.iter_mut().find(|s| s.name == name) {
            step.status = status;
            step.detail = detail;
        }
    }

    /// Pin the shard at `index` of the plan for the remaining steps.
    pub fn activate(&mut self, index: usize) {
        if index < self.plan.len() {
            self.active = Some(index);
        }
    }

    /// Position of the active shard in the plan.
    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    pub fn active_shard(&self) -> Option<&RankedShard> {
        self.active.and_then(|i| self.plan.get(i))
    }

    pub fn record_attempt(
        &mut self,
        step: StepName,
        shard: ShardIdentity,
        outcome: ShardOutcome,
        error: Option<String>,
    ) {
        self.shard_attempts.push(ShardAttempt {
            step,
            shard,
            outcome,
            error,
        });
    }

    pub fn all_steps_resolved(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_resolved())
    }
}
