//! Deployment Orchestrator - The four-step pipeline
//!
//! Generate Files -> Upload -> Link Custom Domain -> Update Registrar DNS.
//!
//! Upload, link and DNS walk the shard plan in order and fail over on rate
//! limits, timeouts and server faults; any other provider error aborts the
//! job (or, for DNS, the step). Once a shard accepts the upload it becomes
//! the job's active shard. If a later step has to move on, the site is
//! re-hosted on the next shard, which then becomes active. Health outcomes
//! are recorded for every shard touched, and the step trace is written to
//! the job record after every transition.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use shardline_health::ShardHealthStore;
use shardline_routing::{ShardPlanner, SiteRequest};
use shardline_types::{
    DeployStep, DomainId, JobId, JobStatus, RankedShard, ShardIdentity, ShardOutcome, StepName,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::best_effort::{BestEffort, SideEffect, SideEffectKind};
use crate::context::{CancellationFlag, DeployContext, ShardAttempt};
use crate::error::DeployError;
use crate::provider::{
    classify_failure, HostingProvider, ProviderError, ProviderProject, Registrar, SiteFile,
    SiteGenerator,
};
use crate::store::{DeployJob, DeploymentRecord, DomainRecord, DomainStore, JobStore, JobUpdate};

/// Message recorded on jobs stopped through their cancellation flag.
pub const CANCELLED_MESSAGE: &str = "cancelled";

/// Tunables of a single pipeline run.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Deadline applied to each outbound provider or registrar call, and to
    /// shard planning as a whole.
    pub step_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(60),
        }
    }
}

/// Result of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub run_id: Uuid,
    pub job_id: JobId,
    pub domain_id: DomainId,
    pub status: JobStatus,
    pub active_shard: Option<ShardIdentity>,
    pub project_name: String,
    pub steps: Vec<DeployStep>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub side_effects: Vec<SideEffect>,
    pub shard_attempts: Vec<ShardAttempt>,
}

impl DeployReport {
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Completed
    }

    pub fn step(&self, name: StepName) -> Option<&DeployStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Latest recorded result for a side effect.
    pub fn side_effect(&self, kind: SideEffectKind) -> Option<&BestEffort<String>> {
        self.side_effects
            .iter()
            .rev()
            .find(|e| e.kind == kind)
            .map(|e| &e.result)
    }
}

type StepResult = std::result::Result<(), String>;

/// Runs deployment jobs end to end.
pub struct Orchestrator {
    planner: Arc<ShardPlanner>,
    health: Arc<ShardHealthStore>,
    generator: Arc<dyn SiteGenerator>,
    provider: Arc<dyn HostingProvider>,
    registrars: Vec<Arc<dyn Registrar>>,
    domains: Arc<dyn DomainStore>,
    jobs: Arc<dyn JobStore>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        planner: Arc<ShardPlanner>,
        generator: Arc<dyn SiteGenerator>,
        provider: Arc<dyn HostingProvider>,
        domains: Arc<dyn DomainStore>,
        jobs: Arc<dyn JobStore>,
    ) -> Self {
        let health = planner.health().clone();
        Self {
            planner,
            health,
            generator,
            provider,
            registrars: Vec::new(),
            domains,
            jobs,
            settings: OrchestratorSettings::default(),
        }
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn Registrar>) -> Self {
        self.registrars.push(registrar);
        self
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn planner(&self) -> &Arc<ShardPlanner> {
        &self.planner
    }

    /// Run `job` through the pipeline.
    ///
    /// Never fails: every outcome, including a missing domain, ends up in the
    /// returned report and (best effort) in the job record.
    #[instrument(skip(self, job, cancel), fields(job_id = %job.id, domain_id = %job.domain_id))]
    pub async fn run(&self, job: DeployJob, cancel: CancellationFlag) -> DeployReport {
        let run_id = Uuid::new_v4();

        // 1. Load the site's domain row
        let domain = match self.domains.get_domain(&job.domain_id).await {
            Ok(Some(domain)) => Ok(domain),
            Ok(None) => Err(DeployError::DomainNotFound(job.domain_id.clone()).to_string()),
            Err(e) => Err(e.to_string()),
        };

        let mut ctx = match domain {
            Ok(domain) => DeployContext::new(job, domain),
            Err(message) => {
                let placeholder = DomainRecord::new(job.domain_id.as_str(), "");
                let mut ctx = DeployContext::new(job, placeholder);
                self.finish_failure(&mut ctx, message, false).await;
                return Self::report(run_id, ctx);
            }
        };

        info!(
            hostname = %ctx.domain.hostname,
            project = %ctx.project_name,
            attempt = ctx.attempts,
            "Starting deployment"
        );
        self.persist(&mut ctx).await;

        // 2. Run the steps; the first fatal error stops the pipeline
        match self.execute(&mut ctx, &cancel).await {
            Ok(()) => self.finish_success(&mut ctx).await,
            Err(message) => self.finish_failure(&mut ctx, message, true).await,
        }

        Self::report(run_id, ctx)
    }

    async fn execute(&self, ctx: &mut DeployContext, cancel: &CancellationFlag) -> StepResult {
        self.checkpoint(ctx, cancel, StepName::GenerateFiles)?;
        self.generate_files(ctx).await?;

        self.checkpoint(ctx, cancel, StepName::Upload)?;
        self.upload(ctx).await?;

        self.checkpoint(ctx, cancel, StepName::LinkCustomDomain)?;
        self.link_custom_domain(ctx).await?;

        self.checkpoint(ctx, cancel, StepName::UpdateDns)?;
        self.update_dns(ctx).await;

        Ok(())
    }

    fn checkpoint(&self, ctx: &DeployContext, cancel: &CancellationFlag, next: StepName) -> StepResult {
        if cancel.is_cancelled() {
            warn!(job_id = %ctx.job_id, next_step = %next, "Job cancelled between steps");
            return Err(CANCELLED_MESSAGE.to_string());
        }
        Ok(())
    }

    async fn generate_files(&self, ctx: &mut DeployContext) -> StepResult {
        let step = StepName::GenerateFiles;
        ctx.start_step(step);
        self.persist(ctx).await;

        let generated = self
            .bounded(self.generator.generate(&ctx.domain, &ctx.payload))
            .await;

        match generated {
            Ok(files) if files.is_empty() => {
                let message = "Site generator produced no files".to_string();
                ctx.fail_step(step, message.clone());
                Err(message)
            }
            Ok(files) => {
                debug!(files = files.len(), "Site files generated");
                ctx.complete_step(step, format!("Generated {} files", files.len()));
                ctx.files = files;
                self.persist(ctx).await;
                Ok(())
            }
            Err(e) => {
                let message = format!("{step} failed: {e}");
                ctx.fail_step(step, message.clone());
                Err(message)
            }
        }
    }

    async fn upload(&self, ctx: &mut DeployContext) -> StepResult {
        let step = StepName::Upload;
        ctx.start_step(step);
        self.persist(ctx).await;

        let site = SiteRequest {
            site_id: ctx.domain.id.as_str().to_string(),
            niche: ctx.domain.niche.clone(),
            pinned_shard: ctx
                .payload
                .pinned_shard
                .clone()
                .or_else(|| ctx.domain.shard_override.clone()),
        };

        let timeout = self.settings.step_timeout;
        let plan = match tokio::time::timeout(timeout, self.planner.plan(&site)).await {
            Ok(Ok(plan)) => plan,
            Ok(Err(e)) => {
                let message = e.to_string();
                ctx.fail_step(step, message.clone());
                return Err(message);
            }
            Err(_) => {
                let message = format!("Shard planning timed out after {}s", timeout.as_secs());
                warn!(timeout_secs = timeout.as_secs(), "Shard planning did not finish in time");
                ctx.fail_step(step, message.clone());
                return Err(message);
            }
        };
        ctx.warnings.extend(plan.warnings.iter().cloned());
        ctx.plan = plan.shards;

        let total = ctx.plan.len();
        let mut failures = Vec::with_capacity(total);

        for index in 0..total {
            let shard = ctx.plan[index].clone();
            let attempt = self.upload_to(&shard, &ctx.project_name, &ctx.files).await;

            match attempt {
                Ok(project) => {
                    self.record(ctx, step, &shard, ShardOutcome::Success, None);
                    let detail = format!(
                        "Uploaded {} files to {} on shard {}",
                        ctx.files.len(),
                        project.name,
                        shard.shard_key()
                    );
                    info!(
                        shard_key = %shard.shard_key(),
                        account_id = %shard.account_id(),
                        project = %project.name,
                        position = index,
                        "Upload succeeded"
                    );
                    ctx.activate(index);
                    ctx.project = Some(project);
                    ctx.complete_step(step, detail);
                    self.persist(ctx).await;
                    return Ok(());
                }
                Err(error) => {
                    let class = classify_failure(&error);
                    self.record(ctx, step, &shard, class.outcome(), Some(error.to_string()));
                    failures.push(format!("{}: {}", shard.shard_key(), error));

                    if !class.is_retryable() {
                        warn!(
                            shard_key = %shard.shard_key(),
                            error = %error,
                            "Non-retryable upload failure; aborting job"
                        );
                        let message = error.to_string();
                        ctx.fail_step(step, format!("Shard {}: {}", shard.shard_key(), message));
                        return Err(message);
                    }

                    if index + 1 < total {
                        warn!(
                            shard_key = %shard.shard_key(),
                            next_shard = %ctx.plan[index + 1].shard_key(),
                            error = %error,
                            class = ?class,
                            "Upload failed; failing over"
                        );
                    }
                }
            }
        }

        let message = exhausted(step, &failures, total);
        warn!(shards = total, "Every planned shard failed during upload");
        ctx.fail_step(step, message.clone());
        Err(message)
    }

    async fn upload_to(
        &self,
        shard: &RankedShard,
        project_name: &str,
        files: &[SiteFile],
    ) -> std::result::Result<ProviderProject, ProviderError> {
        let project = self
            .bounded(self.provider.create_or_reuse_project(project_name, &shard.credentials))
            .await?;
        self.bounded(self.provider.upload_files(&project, files, &shard.credentials))
            .await?;
        Ok(project)
    }

    /// Put the site on a shard other than the active one: create the project,
    /// upload the file set and, when `link` is set, attach the custom domain.
    async fn rehost(
        &self,
        ctx: &DeployContext,
        shard: &RankedShard,
        link: bool,
    ) -> std::result::Result<ProviderProject, ProviderError> {
        let project = self.upload_to(shard, &ctx.project_name, &ctx.files).await?;
        if link {
            self.bounded(
                self.provider
                    .link_custom_domain(&project, &ctx.domain.hostname, &shard.credentials),
            )
            .await?;
        }
        Ok(project)
    }

    /// Adopt `project` on the shard at `index` after a successful re-host.
    fn move_to(&self, ctx: &mut DeployContext, step: StepName, index: usize, project: ProviderProject) {
        if let Some(shard) = ctx.plan.get(index) {
            info!(
                step = %step,
                shard_key = %shard.shard_key(),
                account_id = %shard.account_id(),
                position = index,
                "Site moved to fallback shard"
            );
            ctx.warnings.push(format!(
                "{step} moved the site to shard {}",
                shard.shard_key()
            ));
        }
        ctx.activate(index);
        ctx.project = Some(project);
    }

    async fn link_custom_domain(&self, ctx: &mut DeployContext) -> StepResult {
        let step = StepName::LinkCustomDomain;

        if ctx.payload.skip_custom_domain {
            ctx.skip_step(step, "custom domain disabled for this job");
            self.persist(ctx).await;
            return Ok(());
        }
        let (Some(start), Some(project)) = (ctx.active_index(), ctx.project.clone()) else {
            ctx.skip_step(step, "no provider project");
            self.persist(ctx).await;
            return Ok(());
        };

        ctx.start_step(step);
        self.persist(ctx).await;

        let hostname = ctx.domain.hostname.clone();
        let total = ctx.plan.len();
        let mut failures = Vec::new();

        for index in start..total {
            let shard = ctx.plan[index].clone();
            let linked = if index == start {
                self.bounded(self.provider.link_custom_domain(&project, &hostname, &shard.credentials))
                    .await
                    .map(|()| None)
            } else {
                self.rehost(ctx, &shard, true).await.map(Some)
            };

            match linked {
                Ok(moved) => {
                    self.record(ctx, step, &shard, ShardOutcome::Success, None);
                    if let Some(project) = moved {
                        self.move_to(ctx, step, index, project);
                    }
                    ctx.complete_step(step, format!("Linked {} on shard {}", hostname, shard.shard_key()));
                    self.persist(ctx).await;
                    return Ok(());
                }
                Err(error) => {
                    let class = classify_failure(&error);
                    self.record(ctx, step, &shard, class.outcome(), Some(error.to_string()));
                    failures.push(format!("{}: {}", shard.shard_key(), error));

                    if !class.is_retryable() {
                        warn!(
                            shard_key = %shard.shard_key(),
                            error = %error,
                            "Non-retryable custom domain failure; aborting job"
                        );
                        let message = error.to_string();
                        ctx.fail_step(step, format!("Shard {}: {}", shard.shard_key(), message));
                        return Err(message);
                    }

                    if index + 1 < total {
                        warn!(
                            shard_key = %shard.shard_key(),
                            next_shard = %ctx.plan[index + 1].shard_key(),
                            error = %error,
                            class = ?class,
                            "Custom domain link failed; failing over"
                        );
                    }
                }
            }
        }

        let message = exhausted(step, &failures, total);
        warn!(shards = failures.len(), "Every remaining shard failed during custom domain link");
        ctx.fail_step(step, message.clone());
        Err(message)
    }

    async fn update_dns(&self, ctx: &mut DeployContext) {
        let step = StepName::UpdateDns;

        if ctx.payload.skip_dns {
            self.skip_dns(ctx, "DNS update disabled for this job").await;
            return;
        }

        let registrar_name = ctx.domain.registrar.clone().unwrap_or_default();
        let registrar = self
            .registrars
            .iter()
            .find(|r| !registrar_name.is_empty() && r.handles(&registrar_name))
            .cloned();
        let Some(registrar) = registrar else {
            let reason = if registrar_name.is_empty() {
                "domain has no registrar".to_string()
            } else {
                format!("no registrar client for {registrar_name}")
            };
            self.skip_dns(ctx, &reason).await;
            return;
        };
        let Some(start) = ctx.active_index() else {
            self.skip_dns(ctx, "no active shard").await;
            return;
        };

        ctx.start_step(step);
        self.persist(ctx).await;

        let hostname = ctx.domain.hostname.clone();
        let link = !ctx.payload.skip_custom_domain;
        let total = ctx.plan.len();
        let mut failures = Vec::new();
        let mut nameservers = None;

        for index in start..total {
            let shard = ctx.plan[index].clone();

            // 1. Off the active shard the site has to be hosted there first
            let moved = if index == start {
                None
            } else {
                match self.rehost(ctx, &shard, link).await {
                    Ok(project) => Some(project),
                    Err(error) => {
                        let class = classify_failure(&error);
                        self.record(ctx, step, &shard, class.outcome(), Some(error.to_string()));
                        if !class.is_retryable() {
                            self.dns_failed(ctx, format!("re-hosting on shard {}: {}", shard.shard_key(), error))
                                .await;
                            return;
                        }
                        failures.push(format!("{}: {}", shard.shard_key(), error));
                        continue;
                    }
                }
            };

            // 2. Ask the shard for the zone's nameservers
            let zone = self
                .bounded(self.provider.zone_nameservers(&hostname, &shard.credentials))
                .await;

            match zone {
                Ok(found) if !found.is_empty() => {
                    self.record(ctx, step, &shard, ShardOutcome::Success, None);
                    if let Some(project) = moved {
                        self.move_to(ctx, step, index, project);
                    }
                    nameservers = Some(found);
                    break;
                }
                Ok(_) => {
                    self.dns_failed(ctx, format!("shard {} returned no nameservers", shard.shard_key()))
                        .await;
                    return;
                }
                Err(error) => {
                    let class = classify_failure(&error);
                    self.record(ctx, step, &shard, class.outcome(), Some(error.to_string()));
                    if !class.is_retryable() {
                        self.dns_failed(ctx, format!("zone lookup on shard {}: {}", shard.shard_key(), error))
                            .await;
                        return;
                    }
                    warn!(shard_key = %shard.shard_key(), error = %error, "Zone lookup failed; trying next shard");
                    failures.push(format!("{}: {}", shard.shard_key(), error));
                }
            }
        }

        let Some(nameservers) = nameservers else {
            self.dns_failed(ctx, exhausted(step, &failures, total)).await;
            return;
        };

        // 3. Point the registrar at them
        match self
            .bounded(registrar.update_nameservers(&hostname, &nameservers))
            .await
        {
            Ok(()) => {
                let listed = nameservers.join(", ");
                ctx.complete_step(step, format!("Nameservers set to {listed}"));
                ctx.side_effects.push(SideEffect::new(
                    SideEffectKind::UpdateDns,
                    BestEffort::Done(listed),
                ));
                self.persist(ctx).await;
            }
            Err(error) => {
                self.dns_failed(ctx, format!("registrar update: {error}")).await;
            }
        }
    }

    async fn skip_dns(&self, ctx: &mut DeployContext, reason: &str) {
        ctx.skip_step(StepName::UpdateDns, reason);
        ctx.side_effects.push(SideEffect::new(
            SideEffectKind::UpdateDns,
            BestEffort::skipped(reason),
        ));
        self.persist(ctx).await;
    }

    async fn dns_failed(&self, ctx: &mut DeployContext, message: String) {
        warn!(error = %message, "DNS update failed; continuing without it");
        ctx.fail_step(StepName::UpdateDns, message.clone());
        ctx.side_effects.push(SideEffect::new(
            SideEffectKind::UpdateDns,
            BestEffort::Failed(message),
        ));
        self.persist(ctx).await;
    }

    async fn finish_success(&self, ctx: &mut DeployContext) {
        let Some(shard) = ctx.active_shard().map(RankedShard::identity) else {
            self.finish_failure(ctx, "pipeline finished without an active shard".to_string(), true)
                .await;
            return;
        };

        let deployment = DeploymentRecord {
            project_name: ctx
                .project
                .as_ref()
                .map(|p| p.name.clone())
                .unwrap_or_else(|| ctx.project_name.clone()),
            shard: shard.clone(),
            deployed_at: Utc::now(),
        };

        if let Err(e) = self.domains.mark_deployed(&ctx.domain.id, &deployment).await {
            self.finish_failure(ctx, format!("Failed to record deployment: {e}"), true)
                .await;
            return;
        }

        let lifecycle = BestEffort::from_result(
            self.domains
                .advance_lifecycle(&ctx.domain.id)
                .await
                .map(|()| "advanced".to_string()),
        );
        if let BestEffort::Failed(reason) = &lifecycle {
            warn!(error = %reason, "Lifecycle advance failed after deploy");
        }
        ctx.side_effects
            .push(SideEffect::new(SideEffectKind::AdvanceLifecycle, lifecycle));

        ctx.status = JobStatus::Completed;
        ctx.error = None;
        self.persist(ctx).await;

        info!(
            shard = %shard,
            project = %deployment.project_name,
            warnings = ctx.warnings.len(),
            "Deployment completed"
        );
    }

    async fn finish_failure(&self, ctx: &mut DeployContext, message: String, domain_loaded: bool) {
        let rollback = if domain_loaded {
            BestEffort::from_result(
                self.domains
                    .clear_deployed(&ctx.domain.id)
                    .await
                    .map(|()| "deployed flag cleared".to_string()),
            )
        } else {
            BestEffort::skipped("domain not loaded")
        };
        if let BestEffort::Failed(reason) = &rollback {
            warn!(error = %reason, "Deployed flag rollback failed");
        }
        ctx.side_effects
            .push(SideEffect::new(SideEffectKind::RollbackDeployed, rollback));

        warn!(error = %message, "Deployment failed");
        ctx.status = JobStatus::Failed;
        ctx.error = Some(message);
        self.persist(ctx).await;
    }

    fn record(
        &self,
        ctx: &mut DeployContext,
        step: StepName,
        shard: &RankedShard,
        outcome: ShardOutcome,
        error: Option<String>,
    ) {
        let identity = shard.identity();
        self.health.record_outcome(&identity, outcome);
        ctx.record_attempt(step, identity, outcome, error);
    }

    /// Write the job record; failures are kept on the report, never raised.
    async fn persist(&self, ctx: &mut DeployContext) {
        let update = JobUpdate {
            job_id: ctx.job_id.clone(),
            status: ctx.status,
            steps: ctx.steps.clone(),
            error: ctx.error.clone(),
            attempts: ctx.attempts,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.jobs.save(&update).await {
            warn!(job_id = %ctx.job_id, error = %e, "Failed to write job record");
            ctx.side_effects.push(SideEffect::new(
                SideEffectKind::JobRecordWrite,
                BestEffort::Failed(e.to_string()),
            ));
        }
    }

    async fn bounded<T, F>(&self, call: F) -> std::result::Result<T, ProviderError>
    where
        F: Future<Output = std::result::Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.settings.step_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::timeout(self.settings.step_timeout)),
        }
    }

    fn report(run_id: Uuid, ctx: DeployContext) -> DeployReport {
        DeployReport {
            run_id,
            active_shard: ctx.active_shard().map(RankedShard::identity),
            job_id: ctx.job_id,
            domain_id: ctx.domain.id,
            status: ctx.status,
            project_name: ctx.project_name,
            steps: ctx.steps,
            error: ctx.error,
            warnings: ctx.warnings,
            side_effects: ctx.side_effects,
            shard_attempts: ctx.shard_attempts,
        }
    }
}

/// Aggregate failure message. Steps after upload start from the active
/// shard, so they may have tried fewer shards than were planned.
fn exhausted(step: StepName, failures: &[String], planned: usize) -> String {
    let tried = failures.len();
    let scope = if tried == planned {
        format!("All {tried} shards")
    } else {
        format!("All {tried} remaining of {planned} planned shards")
    };
    format!("{scope} failed during {step}: {}", failures.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_message_lists_every_shard() {
        let message = exhausted(
            StepName::Upload,
            &["east-1: HTTP 503: down".to_string(), "west-1: HTTP 502: bad gateway".to_string()],
            2,
        );
        assert_eq!(
            message,
            "All 2 shards failed during Upload: east-1: HTTP 503: down; west-1: HTTP 502: bad gateway"
        );
    }

    #[test]
    fn test_exhausted_message_counts_remaining_shards() {
        let message = exhausted(
            StepName::LinkCustomDomain,
            &["west-1: HTTP 429: slow down".to_string()],
            3,
        );
        assert_eq!(
            message,
            "All 1 remaining of 3 planned shards failed during Link Custom Domain: west-1: HTTP 429: slow down"
        );
    }

    #[test]
    fn test_default_settings() {
        assert_eq!(OrchestratorSettings::default().step_timeout, Duration::from_secs(60));
    }
}
