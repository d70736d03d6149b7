//! Domain table and job record seams

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shardline_types::{DeployStep, DomainId, JobId, JobStatus, ShardIdentity};

use crate::error::Result;

/// The slice of a site's domain row the pipeline reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub id: DomainId,
    pub hostname: String,
    /// Registrar the domain is registered with, e.g. `namecheap`.
    #[serde(default)]
    pub registrar: Option<String>,
    /// Operator pin to a shard key, account id or connection id.
    #[serde(default)]
    pub shard_override: Option<String>,
    #[serde(default)]
    pub niche: Option<String>,
    #[serde(default)]
    pub deployed: bool,
    #[serde(default)]
    pub deployed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub shard: Option<ShardIdentity>,
}

impl DomainRecord {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            id: DomainId::new(id),
            hostname: hostname.into(),
            registrar: None,
            shard_override: None,
            niche: None,
            deployed: false,
            deployed_at: None,
            project_name: None,
            shard: None,
        }
    }
}

/// Where a successful deploy landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub project_name: String,
    pub shard: ShardIdentity,
    pub deployed_at: DateTime<Utc>,
}

/// Per-job options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployPayload {
    /// Explicit project name; derived from the hostname when absent.
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub skip_custom_domain: bool,
    #[serde(default)]
    pub skip_dns: bool,
    /// Pin for this job only; wins over the domain's override.
    #[serde(default)]
    pub pinned_shard: Option<String>,
    /// Opaque generator input.
    #[serde(default)]
    pub content: serde_json::Value,
}

/// A queued deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployJob {
    pub id: JobId,
    pub domain_id: DomainId,
    #[serde(default)]
    pub payload: DeployPayload,
    #[serde(default)]
    pub attempts: u32,
}

impl DeployJob {
    pub fn new(id: impl Into<String>, domain_id: impl Into<String>) -> Self {
        Self {
            id: JobId::new(id),
            domain_id: DomainId::new(domain_id),
            payload: DeployPayload::default(),
            attempts: 0,
        }
    }

    pub fn with_payload(mut self, payload: DeployPayload) -> Self {
        self.payload = payload;
        self
    }
}

/// Snapshot written to the job record after every step transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub job_id: JobId,
    pub status: JobStatus,
    pub steps: Vec<DeployStep>,
    pub error: Option<String>,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

/// Site/domain table.
#[async_trait]
pub trait DomainStore: Send + Sync {
    async fn get_domain(&self, id: &DomainId) -> Result<Option<DomainRecord>>;

    /// Set the deployed flag, timestamp, project name and shard.
    async fn mark_deployed(&self, id: &DomainId, deployment: &DeploymentRecord) -> Result<()>;

    /// Roll the deployed flag back to false.
    async fn clear_deployed(&self, id: &DomainId) -> Result<()>;

    /// Move the site to its next lifecycle stage after a deploy.
    async fn advance_lifecycle(&self, id: &DomainId) -> Result<()>;
}

/// Deploy job queue table.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Atomically move the oldest queued job to processing and return it.
    async fn claim_next(&self) -> Result<Option<DeployJob>>;

    async fn save(&self, update: &JobUpdate) -> Result<()>;
}
