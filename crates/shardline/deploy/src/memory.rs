//! In-memory collaborators for the deployment pipeline
//!
//! Scriptable stand-ins for the domain table, job queue, hosting provider,
//! site generator and registrar. Suitable for development and testing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use shardline_types::{AccountId, DomainId, JobId, JobStatus, ProviderCredentials};

use crate::error::{DeployError, Result};
use crate::provider::{
    HostingProvider, ProviderError, ProviderProject, Registrar, SiteFile, SiteGenerator,
};
use crate::store::{
    DeployJob, DeployPayload, DeploymentRecord, DomainRecord, DomainStore, JobStore, JobUpdate,
};

/// In-memory domain table
pub struct InMemoryDomainStore {
    domains: DashMap<DomainId, DomainRecord>,
    lifecycle_advances: DashMap<DomainId, u32>,
    fail_mark_deployed: AtomicBool,
    fail_lifecycle: AtomicBool,
    fail_rollback: AtomicBool,
}

impl InMemoryDomainStore {
    pub fn new() -> Self {
        Self {
            domains: DashMap::new(),
            lifecycle_advances: DashMap::new(),
            fail_mark_deployed: AtomicBool::new(false),
            fail_lifecycle: AtomicBool::new(false),
            fail_rollback: AtomicBool::new(false),
        }
    }

    pub fn insert(&self, domain: DomainRecord) {
        self.domains.insert(domain.id.clone(), domain);
    }

    pub fn get(&self, id: &DomainId) -> Option<DomainRecord> {
        self.domains.get(id).map(|d| d.value().clone())
    }

    /// Lifecycle transitions applied to `id` so far.
    pub fn lifecycle_advances(&self, id: &DomainId) -> u32 {
        self.lifecycle_advances.get(id).map(|c| *c).unwrap_or(0)
    }

    pub fn set_fail_mark_deployed(&self, fail: bool) {
        self.fail_mark_deployed.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_lifecycle(&self, fail: bool) {
        self.fail_lifecycle.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_rollback(&self, fail: bool) {
        self.fail_rollback.store(fail, Ordering::SeqCst);
    }
}

impl Default for InMemoryDomainStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DomainStore for InMemoryDomainStore {
    async fn get_domain(&self, id: &DomainId) -> Result<Option<DomainRecord>> {
        Ok(self.get(id))
    }

    async fn mark_deployed(&self, id: &DomainId, deployment: &DeploymentRecord) -> Result<()> {
        if self.fail_mark_deployed.load(Ordering::SeqCst) {
            return Err(DeployError::DomainStore("update rejected".into()));
        }
        let mut domain = self
            .domains
            .get_mut(id)
            .ok_or_else(|| DeployError::DomainNotFound(id.clone()))?;
        domain.deployed = true;
        domain.deployed_at = Some(deployment.deployed_at);
        domain.project_name = Some(deployment.project_name.clone());
        domain.shard = Some(deployment.shard.clone());
        Ok(())
    }

    async fn clear_deployed(&self, id: &DomainId) -> Result<()> {
        if self.fail_rollback.load(Ordering::SeqCst) {
            return Err(DeployError::DomainStore("rollback rejected".into()));
        }
        let mut domain = self
            .domains
            .get_mut(id)
            .ok_or_else(|| DeployError::DomainNotFound(id.clone()))?;
        domain.deployed = false;
        Ok(())
    }

    async fn advance_lifecycle(&self, id: &DomainId) -> Result<()> {
        if self.fail_lifecycle.load(Ordering::SeqCst) {
            return Err(DeployError::DomainStore("lifecycle transition rejected".into()));
        }
        *self.lifecycle_advances.entry(id.clone()).or_insert(0) += 1;
        Ok(())
    }
}

/// In-memory job queue with FIFO claiming
pub struct InMemoryJobStore {
    queue: Mutex<VecDeque<DeployJob>>,
    records: DashMap<JobId, JobUpdate>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
    claims: AtomicUsize,
    claim_limit: AtomicUsize,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            records: DashMap::new(),
            writes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            claims: AtomicUsize::new(0),
            claim_limit: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn enqueue(&self, job: DeployJob) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(job);
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Latest record written for `id`.
    pub fn record(&self, id: &JobId) -> Option<JobUpdate> {
        self.records.get(id).map(|r| r.value().clone())
    }

    pub fn status(&self, id: &JobId) -> Option<JobStatus> {
        self.records.get(id).map(|r| r.status)
    }

    /// Successful record writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Let `claims` more jobs be claimed, then fail every claim.
    pub fn fail_claims_after(&self, claims: usize) {
        let claimed = self.claims.load(Ordering::SeqCst);
        self.claim_limit.store(claimed.saturating_add(claims), Ordering::SeqCst);
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn claim_next(&self) -> Result<Option<DeployJob>> {
        if self.claims.load(Ordering::SeqCst) >= self.claim_limit.load(Ordering::SeqCst) {
            return Err(DeployError::JobStore("claim rejected".into()));
        }
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| DeployError::JobStore("queue lock poisoned".into()))?;
        let job = queue.pop_front();
        if job.is_some() {
            self.claims.fetch_add(1, Ordering::SeqCst);
        }
        Ok(job)
    }

    async fn save(&self, update: &JobUpdate) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DeployError::JobStore("write rejected".into()));
        }
        self.records.insert(update.job_id.clone(), update.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hosting provider operation, used to script failures per shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOp {
    CreateProject,
    Upload,
    LinkDomain,
    ZoneNameservers,
}

/// One call received by [`ScriptedHostingProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    pub op: ProviderOp,
    pub account_id: AccountId,
    pub target: String,
}

/// Hosting provider whose failures and latency are scripted per account.
///
/// Calls succeed unless an error has been queued for that operation and
/// account; queued errors are consumed one per call.
pub struct ScriptedHostingProvider {
    failures: DashMap<(ProviderOp, AccountId), VecDeque<ProviderError>>,
    delays: DashMap<(ProviderOp, AccountId), Duration>,
    calls: Mutex<Vec<ProviderCall>>,
    nameservers: Vec<String>,
    zone_overrides: DashMap<AccountId, Vec<String>>,
}

impl ScriptedHostingProvider {
    pub fn new() -> Self {
        Self {
            failures: DashMap::new(),
            delays: DashMap::new(),
            calls: Mutex::new(Vec::new()),
            nameservers: vec![
                "ns1.hosting.example".to_string(),
                "ns2.hosting.example".to_string(),
            ],
            zone_overrides: DashMap::new(),
        }
    }

    /// Answer zone lookups made with `account`'s credentials with `nameservers`.
    pub fn set_nameservers(&self, account: &AccountId, nameservers: Vec<String>) {
        self.zone_overrides.insert(account.clone(), nameservers);
    }

    /// Fail the next `op` made with `account`'s credentials.
    pub fn fail_next(&self, op: ProviderOp, account: &AccountId, error: ProviderError) {
        self.failures
            .entry((op, account.clone()))
            .or_default()
            .push_back(error);
    }

    /// Fail every `op` made with `account`'s credentials, `times` times.
    pub fn fail_times(&self, op: ProviderOp, account: &AccountId, error: ProviderError, times: usize) {
        for _ in 0..times {
            self.fail_next(op, account, error.clone());
        }
    }

    pub fn delay(&self, op: ProviderOp, account: &AccountId, delay: Duration) {
        self.delays.insert((op, account.clone()), delay);
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, op: ProviderOp) -> Vec<ProviderCall> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    async fn invoke(
        &self,
        op: ProviderOp,
        credentials: &ProviderCredentials,
        target: &str,
    ) -> std::result::Result<(), ProviderError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ProviderCall {
                op,
                account_id: credentials.account_id.clone(),
                target: target.to_string(),
            });
        }

        let key = (op, credentials.account_id.clone());
        let delay = self.delays.get(&key).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failures.get_mut(&key).and_then(|mut q| q.pop_front());
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Default for ScriptedHostingProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostingProvider for ScriptedHostingProvider {
    async fn create_or_reuse_project(
        &self,
        name: &str,
        credentials: &ProviderCredentials,
    ) -> std::result::Result<ProviderProject, ProviderError> {
        self.invoke(ProviderOp::CreateProject, credentials, name).await?;
        Ok(ProviderProject {
            name: name.to_string(),
            subdomain: Some(format!("{name}.pages.example")),
        })
    }

    async fn upload_files(
        &self,
        project: &ProviderProject,
        _files: &[SiteFile],
        credentials: &ProviderCredentials,
    ) -> std::result::Result<(), ProviderError> {
        self.invoke(ProviderOp::Upload, credentials, &project.name).await
    }

    async fn link_custom_domain(
        &self,
        _project: &ProviderProject,
        hostname: &str,
        credentials: &ProviderCredentials,
    ) -> std::result::Result<(), ProviderError> {
        self.invoke(ProviderOp::LinkDomain, credentials, hostname).await
    }

    async fn zone_nameservers(
        &self,
        hostname: &str,
        credentials: &ProviderCredentials,
    ) -> std::result::Result<Vec<String>, ProviderError> {
        self.invoke(ProviderOp::ZoneNameservers, credentials, hostname).await?;
        Ok(self
            .zone_overrides
            .get(&credentials.account_id)
            .map(|ns| ns.value().clone())
            .unwrap_or_else(|| self.nameservers.clone()))
    }
}

/// Generator returning a fixed file set.
pub struct StaticSiteGenerator {
    files: Vec<SiteFile>,
    failure: Option<ProviderError>,
}

impl StaticSiteGenerator {
    pub fn new(files: Vec<SiteFile>) -> Self {
        Self {
            files,
            failure: None,
        }
    }

    /// A landing page and a stylesheet.
    pub fn landing_page() -> Self {
        Self::new(vec![
            SiteFile::new("index.html", "<!doctype html><title>site</title>"),
            SiteFile::new("style.css", "body { margin: 0 }"),
        ])
    }

    pub fn failing(error: ProviderError) -> Self {
        Self {
            files: Vec::new(),
            failure: Some(error),
        }
    }
}

#[async_trait]
impl SiteGenerator for StaticSiteGenerator {
    async fn generate(
        &self,
        _domain: &DomainRecord,
        _payload: &DeployPayload,
    ) -> std::result::Result<Vec<SiteFile>, ProviderError> {
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(self.files.clone()),
        }
    }
}

/// Registrar client that records nameserver updates.
pub struct RecordingRegistrar {
    kind: String,
    updates: Mutex<Vec<(String, Vec<String>)>>,
    fail: AtomicBool,
}

impl RecordingRegistrar {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into().to_lowercase(),
            updates: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn updates(&self) -> Vec<(String, Vec<String>)> {
        self.updates.lock().map(|u| u.clone()).unwrap_or_default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Registrar for RecordingRegistrar {
    fn handles(&self, registrar: &str) -> bool {
        registrar.trim().eq_ignore_ascii_case(&self.kind)
    }

    async fn update_nameservers(
        &self,
        hostname: &str,
        nameservers: &[String],
    ) -> std::result::Result<(), ProviderError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProviderError::with_status(500, "registrar API error"));
        }
        if let Ok(mut updates) = self.updates.lock() {
            updates.push((hostname.to_string(), nameservers.to_vec()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(account: &str) -> ProviderCredentials {
        ProviderCredentials {
            account_id: AccountId::new(account),
            api_token: "token".into(),
        }
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let provider = ScriptedHostingProvider::new();
        let a = AccountId::new("acct-a");
        provider.fail_next(ProviderOp::CreateProject, &a, ProviderError::with_status(429, "slow"));

        let first = provider.create_or_reuse_project("site", &creds("acct-a")).await;
        assert_eq!(first.unwrap_err().status, Some(429));

        let second = provider.create_or_reuse_project("site", &creds("acct-a")).await;
        assert_eq!(second.unwrap().name, "site");

        let other = provider.create_or_reuse_project("site", &creds("acct-b")).await;
        assert!(other.is_ok());
        assert_eq!(provider.calls_for(ProviderOp::CreateProject).len(), 3);
    }

    #[tokio::test]
    async fn test_job_store_claims_fifo() {
        let store = InMemoryJobStore::new();
        store.enqueue(DeployJob::new("job-1", "dom-1"));
        store.enqueue(DeployJob::new("job-2", "dom-2"));

        assert_eq!(store.claim_next().await.unwrap().unwrap().id.as_str(), "job-1");
        assert_eq!(store.claim_next().await.unwrap().unwrap().id.as_str(), "job-2");
        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_domain_store_deploy_and_rollback() {
        let store = InMemoryDomainStore::new();
        store.insert(DomainRecord::new("dom-1", "example.com"));
        let id = DomainId::new("dom-1");

        let record = DeploymentRecord {
            project_name: "example-com".into(),
            shard: shardline_types::ShardIdentity::new(
                shardline_types::ShardKey::new("east-1"),
                AccountId::new("acct-a"),
            ),
            deployed_at: chrono::Utc::now(),
        };
        store.mark_deployed(&id, &record).await.unwrap();
        assert!(store.get(&id).unwrap().deployed);

        store.clear_deployed(&id).await.unwrap();
        assert!(!store.get(&id).unwrap().deployed);

        store.advance_lifecycle(&id).await.unwrap();
        assert_eq!(store.lifecycle_advances(&id), 1);
    }

    #[test]
    fn test_registrar_matching_is_case_insensitive() {
        let registrar = RecordingRegistrar::new("Namecheap");
        assert!(registrar.handles("namecheap"));
        assert!(registrar.handles(" NAMECHEAP "));
        assert!(!registrar.handles("godaddy"));
    }
}
