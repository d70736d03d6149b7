//! End-to-end pipeline runs against scripted in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use shardline_deploy::memory::{
    InMemoryDomainStore, InMemoryJobStore, ProviderOp, RecordingRegistrar, ScriptedHostingProvider,
    StaticSiteGenerator,
};
use shardline_deploy::{
    BestEffort, CancellationFlag, DeployJob, DeployPayload, DeployWorker, DomainRecord,
    Orchestrator, OrchestratorSettings, ProviderError, SideEffectKind, SiteGenerator,
    CANCELLED_MESSAGE,
};
use shardline_health::{HealthConfig, InMemoryHealthPersistence, ShardHealthStore};
use shardline_registry::{
    AssignmentSnapshotCache, ConnectionRecord, InMemoryAccountResolver, InMemoryAssignmentStore,
    InMemoryConnectionStore, InMemoryCredentialCipher, ResolvedAccount, ShardRegistry,
    DEFAULT_LOOKUP_TIMEOUT,
};
use shardline_routing::{RoutingPolicy, ShardPlan, ShardPlanner, SiteRequest};
use shardline_types::{AccountId, DomainId, JobId, JobStatus, ShardIdentity, StepName, StepStatus};

const SHARDS: [&str; 3] = ["shard-a", "shard-b", "shard-c"];

struct Harness {
    store: Arc<InMemoryConnectionStore>,
    cipher: Arc<InMemoryCredentialCipher>,
    resolver: Arc<InMemoryAccountResolver>,
    planner: Arc<ShardPlanner>,
    health: Arc<ShardHealthStore>,
    persistence: Arc<InMemoryHealthPersistence>,
    provider: Arc<ScriptedHostingProvider>,
    domains: Arc<InMemoryDomainStore>,
    jobs: Arc<InMemoryJobStore>,
    registrar: Arc<RecordingRegistrar>,
    orchestrator: Arc<Orchestrator>,
}

impl Harness {
    async fn new() -> Self {
        Self::with(OrchestratorSettings::default(), Arc::new(StaticSiteGenerator::landing_page()), &SHARDS).await
    }

    async fn with(settings: OrchestratorSettings, generator: Arc<dyn SiteGenerator>, shards: &[&str]) -> Self {
        let store = Arc::new(InMemoryConnectionStore::new());
        let cipher = Arc::new(InMemoryCredentialCipher::new());
        for (i, key) in shards.iter().enumerate() {
            let blob = format!("blob-{key}");
            cipher.add_secret(blob.clone(), format!("token-{key}"));
            store
                .insert(ConnectionRecord {
                    id: format!("conn-{i}"),
                    display_name: Some(key.to_string()),
                    config: json!({ "account_id": account(i as u8 + 1), "shard_key": key }),
                    encrypted_credential: Some(blob),
                })
                .await;
        }

        let resolver = Arc::new(InMemoryAccountResolver::new());
        let registry = Arc::new(ShardRegistry::new(
            store.clone(),
            cipher.clone(),
            resolver.clone(),
        ));
        let snapshots = Arc::new(AssignmentSnapshotCache::new(Arc::new(InMemoryAssignmentStore::new())));
        let persistence = Arc::new(InMemoryHealthPersistence::new());
        let health = Arc::new(ShardHealthStore::with_persistence(
            HealthConfig::default(),
            persistence.clone(),
        ));
        let planner = Arc::new(ShardPlanner::new(
            registry,
            health.clone(),
            snapshots,
            RoutingPolicy::default(),
        ));

        let provider = Arc::new(ScriptedHostingProvider::new());
        let domains = Arc::new(InMemoryDomainStore::new());
        let jobs = Arc::new(InMemoryJobStore::new());
        let registrar = Arc::new(RecordingRegistrar::new("namecheap"));

        let orchestrator = Orchestrator::new(
            planner.clone(),
            generator,
            provider.clone(),
            domains.clone(),
            jobs.clone(),
        )
        .with_registrar(registrar.clone())
        .with_settings(settings);

        Self {
            store,
            cipher,
            resolver,
            planner,
            health,
            persistence,
            provider,
            domains,
            jobs,
            registrar,
            orchestrator: Arc::new(orchestrator),
        }
    }

    fn add_domain(&self, id: &str, hostname: &str) -> DomainRecord {
        let mut domain = DomainRecord::new(id, hostname);
        domain.registrar = Some("namecheap".into());
        self.domains.insert(domain.clone());
        domain
    }

    /// A shard whose account is known only by a reference the resolver maps.
    async fn add_referenced_shard(&self, key: &str, reference: &str, account_id: &str) {
        let blob = format!("blob-{key}");
        self.cipher.add_secret(blob.clone(), format!("token-{key}"));
        self.resolver.add_account(
            reference,
            ResolvedAccount {
                id: account_id.to_string(),
                name: None,
            },
        );
        self.store
            .insert(ConnectionRecord {
                id: format!("conn-{key}"),
                display_name: Some(key.to_string()),
                config: json!({ "account_ref": reference, "shard_key": key }),
                encrypted_credential: Some(blob),
            })
            .await;
    }

    async fn plan(&self, domain_id: &str) -> ShardPlan {
        self.planner.plan(&SiteRequest::new(domain_id)).await.unwrap()
    }

    fn domain(&self, id: &str) -> DomainRecord {
        self.domains.get(&DomainId::new(id)).unwrap()
    }
}

fn account(n: u8) -> String {
    format!("{:032x}", n)
}

fn upload_only() -> DeployPayload {
    DeployPayload {
        skip_custom_domain: true,
        skip_dns: true,
        ..DeployPayload::default()
    }
}

fn identity_of(plan: &ShardPlan, index: usize) -> ShardIdentity {
    plan.shards[index].identity()
}

fn account_of(plan: &ShardPlan, index: usize) -> AccountId {
    plan.shards[index].account_id().clone()
}

#[tokio::test]
async fn test_rate_limited_primary_fails_over_to_next_shard() {
    let h = Harness::new().await;
    h.add_domain("dom-1", "hiking.example");
    let plan = h.plan("dom-1").await;
    assert_eq!(plan.len(), 3);

    h.provider.fail_next(
        ProviderOp::Upload,
        &account_of(&plan, 0),
        ProviderError::with_status(429, "Too Many Requests"),
    );

    let job = DeployJob::new("job-1", "dom-1").with_payload(upload_only());
    let report = h.orchestrator.run(job, CancellationFlag::new()).await;

    assert!(report.succeeded(), "error: {:?}", report.error);
    assert_eq!(report.active_shard, Some(identity_of(&plan, 1)));

    let primary = h.health.get(&identity_of(&plan, 0)).unwrap();
    assert_eq!(primary.rate_limit_count, 1);
    assert!(h.health.is_cooling_down(&identity_of(&plan, 0)));

    let fallback = h.health.get(&identity_of(&plan, 1)).unwrap();
    assert_eq!(fallback.success_count, 1);
    assert!(h.health.get(&identity_of(&plan, 2)).is_none());

    h.health.flush_persistence().await;
    let persisted = h.persistence.get(&identity_of(&plan, 0)).unwrap();
    assert_eq!(persisted.rate_limit_count, 1);

    let domain = h.domain("dom-1");
    assert!(domain.deployed);
    assert_eq!(domain.shard, Some(identity_of(&plan, 1)));
    assert_eq!(domain.project_name.as_deref(), Some("hiking-example"));

    assert_eq!(report.shard_attempts.len(), 2);
    let link = report.step(StepName::LinkCustomDomain).unwrap();
    assert_eq!(link.status, StepStatus::Done);
    assert!(link.detail.as_deref().unwrap().starts_with("Skipped"));
}

#[tokio::test]
async fn test_all_shards_failing_fails_job_and_rolls_back() {
    let h = Harness::new().await;
    let mut domain = h.add_domain("dom-1", "hiking.example");
    domain.deployed = true;
    h.domains.insert(domain);

    let plan = h.plan("dom-1").await;
    for i in 0..plan.len() {
        h.provider.fail_next(
            ProviderOp::Upload,
            &account_of(&plan, i),
            ProviderError::with_status(503, "Service Unavailable"),
        );
    }

    let report = h
        .orchestrator
        .run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new())
        .await;

    assert_eq!(report.status, JobStatus::Failed);
    let error = report.error.clone().unwrap();
    assert!(error.starts_with("All 3 shards failed during Upload"), "{error}");
    for key in SHARDS {
        assert!(error.contains(key), "{key} missing from {error}");
    }
    assert!(!h.domain("dom-1").deployed);
    assert!(report.side_effect(SideEffectKind::RollbackDeployed).unwrap().is_done());

    for i in 0..plan.len() {
        assert_eq!(h.health.get(&identity_of(&plan, i)).unwrap().failure_count, 1);
    }

    let record = h.jobs.record(&JobId::new("job-1")).unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.error.as_deref(), Some(error.as_str()));
    assert_eq!(record.steps[0].status, StepStatus::Done);
    assert_eq!(record.steps[1].status, StepStatus::Failed);
    assert_eq!(record.steps[2].status, StepStatus::Pending);
    assert_eq!(record.steps[3].status, StepStatus::Pending);
}

#[tokio::test]
async fn test_healthy_run_completes_all_steps() {
    let h = Harness::new().await;
    h.add_domain("dom-1", "hiking.example");
    let plan = h.plan("dom-1").await;

    let report = h
        .orchestrator
        .run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new())
        .await;

    assert!(report.succeeded(), "error: {:?}", report.error);
    assert!(report.steps.iter().all(|s| s.status == StepStatus::Done));
    assert_eq!(report.active_shard, Some(identity_of(&plan, 0)));

    let domain = h.domain("dom-1");
    assert!(domain.deployed);
    assert!(domain.deployed_at.is_some());
    assert_eq!(h.domains.lifecycle_advances(&DomainId::new("dom-1")), 1);

    let updates = h.registrar.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, "hiking.example");
    assert_eq!(updates[0].1.len(), 2);

    let link_calls = h.provider.calls_for(ProviderOp::LinkDomain);
    assert_eq!(link_calls.len(), 1);
    assert_eq!(link_calls[0].account_id, account_of(&plan, 0));

    assert_eq!(
        h.jobs.status(&JobId::new("job-1")),
        Some(JobStatus::Completed)
    );
    assert_eq!(
        report.side_effect(SideEffectKind::AdvanceLifecycle),
        Some(&BestEffort::Done("advanced".to_string()))
    );
    assert!(report.side_effect(SideEffectKind::UpdateDns).unwrap().is_done());
}

#[tokio::test]
async fn test_rerun_after_failure_reaches_completed() {
    let h = Harness::new().await;
    h.add_domain("dom-1", "hiking.example");
    let plan = h.plan("dom-1").await;
    for i in 0..plan.len() {
        h.provider.fail_next(
            ProviderOp::CreateProject,
            &account_of(&plan, i),
            ProviderError::new("502 Bad Gateway"),
        );
    }

    let first = h
        .orchestrator
        .run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new())
        .await;
    assert_eq!(first.status, JobStatus::Failed);

    let mut retry = DeployJob::new("job-1", "dom-1");
    retry.attempts = 1;
    let second = h.orchestrator.run(retry, CancellationFlag::new()).await;

    assert!(second.succeeded(), "error: {:?}", second.error);
    assert!(second.steps.iter().all(|s| s.status == StepStatus::Done));
    assert_eq!(h.jobs.record(&JobId::new("job-1")).unwrap().attempts, 2);
    assert!(h.domain("dom-1").deployed);
}

#[tokio::test]
async fn test_permanent_error_aborts_without_failover() {
    let h = Harness::new().await;
    h.add_domain("dom-1", "hiking.example");
    let plan = h.plan("dom-1").await;
    h.provider.fail_next(
        ProviderOp::Upload,
        &account_of(&plan, 0),
        ProviderError::with_status(403, "invalid token"),
    );

    let report = h
        .orchestrator
        .run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new())
        .await;

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.error.as_deref(), Some("HTTP 403: invalid token"));
    assert_eq!(h.provider.calls_for(ProviderOp::Upload).len(), 1);
    assert_eq!(h.provider.calls_for(ProviderOp::CreateProject).len(), 1);
    assert_eq!(h.health.get(&identity_of(&plan, 0)).unwrap().failure_count, 1);
    assert!(h.health.get(&identity_of(&plan, 1)).is_none());
}

#[tokio::test]
async fn test_domain_override_pins_primary() {
    let h = Harness::new().await;
    let mut domain = h.add_domain("dom-1", "hiking.example");
    domain.shard_override = Some("Shard C".into());
    h.domains.insert(domain);

    let job = DeployJob::new("job-1", "dom-1").with_payload(upload_only());
    let report = h.orchestrator.run(job, CancellationFlag::new()).await;

    assert!(report.succeeded());
    assert_eq!(report.active_shard.unwrap().shard_key.as_str(), "shard-c");
}

#[tokio::test]
async fn test_unhandled_registrar_skips_dns() {
    let h = Harness::new().await;
    let mut domain = h.add_domain("dom-1", "hiking.example");
    domain.registrar = Some("godaddy".into());
    h.domains.insert(domain);

    let report = h
        .orchestrator
        .run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new())
        .await;

    assert!(report.succeeded());
    let dns = report.step(StepName::UpdateDns).unwrap();
    assert_eq!(dns.status, StepStatus::Done);
    assert_eq!(dns.detail.as_deref(), Some("Skipped: no registrar client for godaddy"));
    assert!(report.side_effect(SideEffectKind::UpdateDns).unwrap().is_skipped());
    assert!(h.registrar.updates().is_empty());
    assert!(h.provider.calls_for(ProviderOp::ZoneNameservers).is_empty());
}

#[tokio::test]
async fn test_dns_failure_is_best_effort() {
    let h = Harness::new().await;
    h.add_domain("dom-1", "hiking.example");
    h.registrar.set_fail(true);

    let report = h
        .orchestrator
        .run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new())
        .await;

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.step(StepName::UpdateDns).unwrap().status, StepStatus::Failed);
    assert!(report.side_effect(SideEffectKind::UpdateDns).unwrap().is_failed());
    assert!(h.domain("dom-1").deployed);
}

#[tokio::test]
async fn test_lifecycle_failure_does_not_fail_job() {
    let h = Harness::new().await;
    h.add_domain("dom-1", "hiking.example");
    h.domains.set_fail_lifecycle(true);

    let report = h
        .orchestrator
        .run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new())
        .await;

    assert!(report.succeeded());
    assert!(report.side_effect(SideEffectKind::AdvanceLifecycle).unwrap().is_failed());
}

#[tokio::test]
async fn test_job_record_failures_are_reported_not_raised() {
    let h = Harness::new().await;
    h.add_domain("dom-1", "hiking.example");
    h.jobs.set_fail_writes(true);

    let report = h
        .orchestrator
        .run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new())
        .await;

    assert!(report.succeeded());
    assert!(report.side_effect(SideEffectKind::JobRecordWrite).unwrap().is_failed());
    assert!(h.jobs.record(&JobId::new("job-1")).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_counts_as_transient_failure() {
    let settings = OrchestratorSettings {
        step_timeout: Duration::from_secs(5),
    };
    let h = Harness::with(settings, Arc::new(StaticSiteGenerator::landing_page()), &SHARDS).await;
    h.add_domain("dom-1", "hiking.example");
    let plan = h.plan("dom-1").await;
    h.provider.delay(
        ProviderOp::CreateProject,
        &account_of(&plan, 0),
        Duration::from_secs(120),
    );

    let job = DeployJob::new("job-1", "dom-1").with_payload(upload_only());
    let report = h.orchestrator.run(job, CancellationFlag::new()).await;

    assert!(report.succeeded(), "error: {:?}", report.error);
    assert_eq!(report.active_shard, Some(identity_of(&plan, 1)));
    assert_eq!(h.health.get(&identity_of(&plan, 0)).unwrap().failure_count, 1);
    let first = &report.shard_attempts[0];
    assert!(first.error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_cancelled_job_stops_before_next_step() {
    let h = Harness::new().await;
    let mut domain = h.add_domain("dom-1", "hiking.example");
    domain.deployed = true;
    h.domains.insert(domain);

    let flag = CancellationFlag::new();
    flag.cancel();
    let report = h.orchestrator.run(DeployJob::new("job-1", "dom-1"), flag).await;

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.error.as_deref(), Some(CANCELLED_MESSAGE));
    assert!(report.steps.iter().all(|s| s.status == StepStatus::Pending));
    assert!(h.provider.calls().is_empty());
    assert!(!h.domain("dom-1").deployed);
}

#[tokio::test]
async fn test_missing_domain_fails_job() {
    let h = Harness::new().await;

    let report = h
        .orchestrator
        .run(DeployJob::new("job-1", "missing"), CancellationFlag::new())
        .await;

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.error.as_deref(), Some("Domain not found: missing"));
    assert!(report.side_effect(SideEffectKind::RollbackDeployed).unwrap().is_skipped());
    assert_eq!(h.jobs.status(&JobId::new("job-1")), Some(JobStatus::Failed));
}

#[tokio::test]
async fn test_empty_generator_output_is_fatal() {
    let h = Harness::with(
        OrchestratorSettings::default(),
        Arc::new(StaticSiteGenerator::new(Vec::new())),
        &SHARDS,
    )
    .await;
    h.add_domain("dom-1", "hiking.example");

    let report = h
        .orchestrator
        .run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new())
        .await;

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.step(StepName::GenerateFiles).unwrap().status, StepStatus::Failed);
    assert!(h.provider.calls().is_empty());
}

#[tokio::test]
async fn test_no_candidates_fails_upload() {
    let h = Harness::with(
        OrchestratorSettings::default(),
        Arc::new(StaticSiteGenerator::landing_page()),
        &[],
    )
    .await;
    h.add_domain("dom-1", "hiking.example");

    let report = h
        .orchestrator
        .run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new())
        .await;

    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.error.as_deref().unwrap().contains("no shard candidates"));
    assert_eq!(report.step(StepName::Upload).unwrap().status, StepStatus::Failed);
}

#[tokio::test]
async fn test_worker_runs_claimed_jobs_concurrently() {
    let h = Harness::new().await;
    for i in 1..=3 {
        h.add_domain(&format!("dom-{i}"), &format!("site{i}.example"));
        h.jobs.enqueue(DeployJob::new(format!("job-{i}"), format!("dom-{i}")));
    }

    let worker = DeployWorker::new(h.orchestrator.clone(), h.jobs.clone(), 2);

    let first = worker.run_once().await.unwrap();
    assert_eq!(first.len(), 2);
    let second = worker.run_once().await.unwrap();
    assert_eq!(second.len(), 1);
    assert!(worker.run_once().await.unwrap().is_empty());

    assert!(first.iter().chain(second.iter()).all(|r| r.succeeded()));
    for i in 1..=3 {
        assert_eq!(
            h.jobs.status(&JobId::new(format!("job-{i}"))),
            Some(JobStatus::Completed)
        );
    }
    assert_eq!(worker.in_flight(), 0);
    assert!(!worker.cancel(&JobId::new("job-1")));
}

#[tokio::test]
async fn test_worker_shutdown_stops_claiming() {
    let h = Harness::new().await;
    h.add_domain("dom-1", "site1.example");
    h.jobs.enqueue(DeployJob::new("job-1", "dom-1"));

    let worker = DeployWorker::new(h.orchestrator.clone(), h.jobs.clone(), 2);
    worker.shutdown();

    assert!(worker.run_once().await.unwrap().is_empty());
    assert_eq!(h.jobs.queued(), 1);
    tokio::time::timeout(Duration::from_secs(1), worker.run())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_rate_limited_link_moves_site_to_next_shard() {
    let h = Harness::new().await;
    h.add_domain("dom-1", "hiking.example");
    let plan = h.plan("dom-1").await;
    h.provider.fail_next(
        ProviderOp::LinkDomain,
        &account_of(&plan, 0),
        ProviderError::with_status(429, "slow down"),
    );

    let report = h
        .orchestrator
        .run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new())
        .await;

    assert!(report.succeeded(), "error: {:?}", report.error);
    assert_eq!(report.active_shard, Some(identity_of(&plan, 1)));
    assert!(report.steps.iter().all(|s| s.status == StepStatus::Done));

    let link_calls = h.provider.calls_for(ProviderOp::LinkDomain);
    assert_eq!(link_calls.len(), 2);
    assert_eq!(link_calls[1].account_id, account_of(&plan, 1));
    let uploads = h.provider.calls_for(ProviderOp::Upload);
    assert_eq!(uploads.len(), 2);
    assert_eq!(uploads[1].account_id, account_of(&plan, 1));

    assert_eq!(h.health.get(&identity_of(&plan, 0)).unwrap().rate_limit_count, 1);
    assert_eq!(h.health.get(&identity_of(&plan, 1)).unwrap().success_count, 2);

    let zone = h.provider.calls_for(ProviderOp::ZoneNameservers);
    assert_eq!(zone.len(), 1);
    assert_eq!(zone[0].account_id, account_of(&plan, 1));
    assert_eq!(h.domain("dom-1").shard, Some(identity_of(&plan, 1)));
    assert!(report.warnings.iter().any(|w| w.contains("moved the site")));
}

#[tokio::test]
async fn test_link_failing_on_every_shard_fails_job() {
    let h = Harness::new().await;
    h.add_domain("dom-1", "hiking.example");
    let plan = h.plan("dom-1").await;
    for i in 0..plan.len() {
        h.provider.fail_next(
            ProviderOp::LinkDomain,
            &account_of(&plan, i),
            ProviderError::with_status(502, "Bad Gateway"),
        );
    }

    let report = h
        .orchestrator
        .run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new())
        .await;

    assert_eq!(report.status, JobStatus::Failed);
    let error = report.error.clone().unwrap();
    assert!(error.starts_with("All 3 shards failed during Link Custom Domain"), "{error}");
    assert_eq!(report.step(StepName::LinkCustomDomain).unwrap().status, StepStatus::Failed);
    assert_eq!(report.step(StepName::UpdateDns).unwrap().status, StepStatus::Pending);
    assert!(report.side_effect(SideEffectKind::RollbackDeployed).unwrap().is_done());
    assert!(!h.domain("dom-1").deployed);
    assert!(h.registrar.updates().is_empty());
}

#[tokio::test]
async fn test_link_after_upload_failover_counts_remaining_shards() {
    let h = Harness::new().await;
    h.add_domain("dom-1", "hiking.example");
    let plan = h.plan("dom-1").await;
    h.provider.fail_next(
        ProviderOp::Upload,
        &account_of(&plan, 0),
        ProviderError::with_status(503, "Service Unavailable"),
    );
    for i in 1..plan.len() {
        h.provider.fail_next(
            ProviderOp::LinkDomain,
            &account_of(&plan, i),
            ProviderError::with_status(429, "slow down"),
        );
    }

    let report = h
        .orchestrator
        .run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new())
        .await;

    assert_eq!(report.status, JobStatus::Failed);
    let error = report.error.unwrap();
    assert!(
        error.starts_with("All 2 remaining of 3 planned shards failed during Link Custom Domain"),
        "{error}"
    );
}

#[tokio::test]
async fn test_permanent_link_failure_aborts_without_failover() {
    let h = Harness::new().await;
    h.add_domain("dom-1", "hiking.example");
    let plan = h.plan("dom-1").await;
    h.provider.fail_next(
        ProviderOp::LinkDomain,
        &account_of(&plan, 0),
        ProviderError::with_status(400, "domain already in use"),
    );

    let report = h
        .orchestrator
        .run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new())
        .await;

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.error.as_deref(), Some("HTTP 400: domain already in use"));
    let link = report.step(StepName::LinkCustomDomain).unwrap();
    assert_eq!(link.status, StepStatus::Failed);
    assert!(link.detail.as_deref().unwrap().starts_with(&format!("Shard {}", plan.shards[0].shard_key())));

    assert_eq!(h.provider.calls_for(ProviderOp::LinkDomain).len(), 1);
    assert_eq!(h.provider.calls_for(ProviderOp::Upload).len(), 1);
    assert_eq!(h.health.get(&identity_of(&plan, 0)).unwrap().failure_count, 1);
    assert!(h.health.get(&identity_of(&plan, 1)).is_none());
    assert!(!h.domain("dom-1").deployed);
}

#[tokio::test]
async fn test_transient_zone_lookup_fails_over() {
    let h = Harness::new().await;
    h.add_domain("dom-1", "hiking.example");
    let plan = h.plan("dom-1").await;
    h.provider.fail_next(
        ProviderOp::ZoneNameservers,
        &account_of(&plan, 0),
        ProviderError::with_status(503, "Service Unavailable"),
    );

    let report = h
        .orchestrator
        .run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new())
        .await;

    assert!(report.succeeded(), "error: {:?}", report.error);
    assert_eq!(report.step(StepName::UpdateDns).unwrap().status, StepStatus::Done);
    assert_eq!(report.active_shard, Some(identity_of(&plan, 1)));
    assert_eq!(h.provider.calls_for(ProviderOp::ZoneNameservers).len(), 2);
    assert_eq!(h.provider.calls_for(ProviderOp::LinkDomain).len(), 2);
    assert_eq!(h.registrar.updates().len(), 1);
    assert_eq!(h.health.get(&identity_of(&plan, 0)).unwrap().failure_count, 1);
    assert_eq!(h.domain("dom-1").shard, Some(identity_of(&plan, 1)));
}

#[tokio::test]
async fn test_zone_lookup_failing_everywhere_is_best_effort() {
    let h = Harness::new().await;
    h.add_domain("dom-1", "hiking.example");
    let plan = h.plan("dom-1").await;
    for i in 0..plan.len() {
        h.provider.fail_next(
            ProviderOp::ZoneNameservers,
            &account_of(&plan, i),
            ProviderError::with_status(429, "slow down"),
        );
    }

    let report = h
        .orchestrator
        .run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new())
        .await;

    assert_eq!(report.status, JobStatus::Completed);
    let dns = report.step(StepName::UpdateDns).unwrap();
    assert_eq!(dns.status, StepStatus::Failed);
    assert!(dns.detail.as_deref().unwrap().starts_with("All 3 shards failed during Update Registrar DNS"));
    assert!(report.side_effect(SideEffectKind::UpdateDns).unwrap().is_failed());
    assert_eq!(report.active_shard, Some(identity_of(&plan, 0)));
    assert!(h.registrar.updates().is_empty());
    assert!(h.domain("dom-1").deployed);
}

#[tokio::test]
async fn test_permanent_zone_lookup_failure_keeps_active_shard() {
    let h = Harness::new().await;
    h.add_domain("dom-1", "hiking.example");
    let plan = h.plan("dom-1").await;
    h.provider.fail_next(
        ProviderOp::ZoneNameservers,
        &account_of(&plan, 0),
        ProviderError::with_status(404, "zone not found"),
    );

    let report = h
        .orchestrator
        .run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new())
        .await;

    assert!(report.succeeded());
    let dns = report.step(StepName::UpdateDns).unwrap();
    assert_eq!(dns.status, StepStatus::Failed);
    assert!(dns.detail.as_deref().unwrap().starts_with("zone lookup on shard"));
    assert_eq!(report.active_shard, Some(identity_of(&plan, 0)));
    assert_eq!(h.provider.calls_for(ProviderOp::ZoneNameservers).len(), 1);
    assert!(h.registrar.updates().is_empty());
}

#[tokio::test]
async fn test_empty_nameserver_list_fails_dns_only() {
    let h = Harness::new().await;
    h.add_domain("dom-1", "hiking.example");
    let plan = h.plan("dom-1").await;
    h.provider.set_nameservers(&account_of(&plan, 0), Vec::new());

    let report = h
        .orchestrator
        .run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new())
        .await;

    assert!(report.succeeded());
    let dns = report.step(StepName::UpdateDns).unwrap();
    assert_eq!(dns.status, StepStatus::Failed);
    assert!(dns.detail.as_deref().unwrap().contains("returned no nameservers"));
    assert!(report.side_effect(SideEffectKind::UpdateDns).unwrap().is_failed());
    assert!(h.registrar.updates().is_empty());
    assert!(h.domain("dom-1").deployed);
}

#[tokio::test(start_paused = true)]
async fn test_hung_account_lookup_cannot_stall_planning() {
    let settings = OrchestratorSettings {
        step_timeout: Duration::from_secs(5),
    };
    let h = Harness::with(settings, Arc::new(StaticSiteGenerator::landing_page()), &SHARDS).await;
    h.add_referenced_shard("shard-ref", "acme-main", "Acme-Main").await;
    h.resolver.set_unresponsive(true);
    h.add_domain("dom-1", "hiking.example");

    let report = tokio::time::timeout(
        Duration::from_secs(3600),
        h.orchestrator.run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new()),
    )
    .await
    .expect("job resolves");

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.error.as_deref(), Some("Shard planning timed out after 5s"));
    assert_eq!(report.step(StepName::Upload).unwrap().status, StepStatus::Failed);
    assert!(h.provider.calls().is_empty());
    assert!(report.side_effect(SideEffectKind::RollbackDeployed).unwrap().is_done());
}

#[tokio::test(start_paused = true)]
async fn test_hung_account_lookup_drops_only_that_shard() {
    let h = Harness::new().await;
    h.add_referenced_shard("shard-ref", "acme-main", "Acme-Main").await;
    h.resolver.set_unresponsive(true);
    h.add_domain("dom-1", "hiking.example");

    let started = tokio::time::Instant::now();
    let report = h
        .orchestrator
        .run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new())
        .await;

    assert!(report.succeeded(), "error: {:?}", report.error);
    assert!(started.elapsed() >= DEFAULT_LOOKUP_TIMEOUT);
    assert_ne!(report.active_shard.unwrap().shard_key.as_str(), "shard-ref");
    assert_eq!(h.resolver.lookups(), 1);
}

#[tokio::test]
async fn test_failing_account_lookup_surfaces_as_no_candidates() {
    let h = Harness::with(
        OrchestratorSettings::default(),
        Arc::new(StaticSiteGenerator::landing_page()),
        &[],
    )
    .await;
    h.add_referenced_shard("shard-ref", "acme-main", "Acme-Main").await;
    h.resolver.set_failing(true);
    h.add_domain("dom-1", "hiking.example");

    let report = h
        .orchestrator
        .run(DeployJob::new("job-1", "dom-1"), CancellationFlag::new())
        .await;

    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.error.as_deref().unwrap().contains("no shard candidates"));
    assert_eq!(h.resolver.lookups(), 1);
    assert!(h.provider.calls().is_empty());
}

#[tokio::test]
async fn test_referenced_shard_is_pinned_by_its_account_id() {
    let h = Harness::new().await;
    h.add_referenced_shard("shard-ref", "acme-main", "Acme-Main").await;
    let mut domain = h.add_domain("dom-1", "hiking.example");
    domain.shard_override = Some("ACME-MAIN".into());
    h.domains.insert(domain);

    let job = DeployJob::new("job-1", "dom-1").with_payload(upload_only());
    let report = h.orchestrator.run(job, CancellationFlag::new()).await;

    assert!(report.succeeded(), "error: {:?}", report.error);
    let active = report.active_shard.unwrap();
    assert_eq!(active.shard_key.as_str(), "shard-ref");
    assert_eq!(active.account_id.as_str(), "Acme-Main");
}

#[tokio::test]
async fn test_worker_keeps_reports_when_a_claim_fails() {
    let h = Harness::new().await;
    for i in 1..=3 {
        h.add_domain(&format!("dom-{i}"), &format!("site{i}.example"));
        h.jobs.enqueue(DeployJob::new(format!("job-{i}"), format!("dom-{i}")));
    }
    h.jobs.fail_claims_after(2);

    let worker = DeployWorker::new(h.orchestrator.clone(), h.jobs.clone(), 3);
    let reports = worker.run_once().await.unwrap();

    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.succeeded()));
    assert_eq!(h.jobs.status(&JobId::new("job-2")), Some(JobStatus::Completed));
    assert_eq!(h.jobs.queued(), 1);
    assert_eq!(worker.in_flight(), 0);

    assert!(worker.run_once().await.is_err());
}
