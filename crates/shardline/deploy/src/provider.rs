//! Hosting provider, registrar and generator seams
//!
//! Every outbound call returns `Result<T, ProviderError>`. The orchestrator
//! classifies failures with [`classify_failure`] to decide between failing
//! over to the next shard and aborting the job.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shardline_types::{ProviderCredentials, ShardOutcome};

use crate::store::{DeployPayload, DomainRecord};

/// A failed provider or registrar call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderError {
    /// HTTP status, when the failure came from a response.
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// The error reported when a call outlives its deadline.
    pub fn timeout(after: Duration) -> Self {
        Self::new(format!("request timed out after {}s", after.as_secs_f64()))
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {}: {}", status, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// How a failed call should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Throttled: retry elsewhere, cool the shard down hard.
    RateLimited,
    /// Timeouts and server-side faults: retry elsewhere.
    Transient,
    /// Validation, auth and everything else: abort.
    Permanent,
}

impl FailureClass {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureClass::Permanent)
    }

    /// Health outcome recorded against the shard that failed.
    pub fn outcome(&self) -> ShardOutcome {
        match self {
            FailureClass::RateLimited => ShardOutcome::RateLimited,
            FailureClass::Transient | FailureClass::Permanent => ShardOutcome::Failure,
        }
    }
}

const RATE_LIMIT_SIGNATURES: &[&str] = &["rate limit", "rate-limit", "ratelimit", "too many requests", "429"];

const TRANSIENT_SIGNATURES: &[&str] = &[
    "timeout",
    "timed out",
    "gateway",
    "unavailable",
    "5xx",
    "internal server error",
    "502",
    "503",
    "504",
    "connection reset",
];

pub fn classify_failure(error: &ProviderError) -> FailureClass {
    if error.status == Some(429) {
        return FailureClass::RateLimited;
    }
    if matches!(error.status, Some(408) | Some(500..=599)) {
        return FailureClass::Transient;
    }

    let message = error.message.to_lowercase();
    if RATE_LIMIT_SIGNATURES.iter().any(|s| message.contains(s)) {
        FailureClass::RateLimited
    } else if TRANSIENT_SIGNATURES.iter().any(|s| message.contains(s)) {
        FailureClass::Transient
    } else {
        FailureClass::Permanent
    }
}

/// One generated file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteFile {
    pub path: String,
    pub contents: String,
}

impl SiteFile {
    pub fn new(path: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

/// A hosting project on one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderProject {
    pub name: String,
    /// Provider-assigned hostname of the project.
    pub subdomain: Option<String>,
}

/// Produces the file set for a site.
#[async_trait]
pub trait SiteGenerator: Send + Sync {
    async fn generate(
        &self,
        domain: &DomainRecord,
        payload: &DeployPayload,
    ) -> Result<Vec<SiteFile>, ProviderError>;
}

/// Hosting provider operations, executed with one shard's credentials.
#[async_trait]
pub trait HostingProvider: Send + Sync {
    async fn create_or_reuse_project(
        &self,
        name: &str,
        credentials: &ProviderCredentials,
    ) -> Result<ProviderProject, ProviderError>;

    async fn upload_files(
        &self,
        project: &ProviderProject,
        files: &[SiteFile],
        credentials: &ProviderCredentials,
    ) -> Result<(), ProviderError>;

    async fn link_custom_domain(
        &self,
        project: &ProviderProject,
        hostname: &str,
        credentials: &ProviderCredentials,
    ) -> Result<(), ProviderError>;

    async fn zone_nameservers(
        &self,
        hostname: &str,
        credentials: &ProviderCredentials,
    ) -> Result<Vec<String>, ProviderError>;
}

/// A domain registrar able to repoint nameservers.
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Whether this client manages domains registered with `registrar`.
    fn handles(&self, registrar: &str) -> bool;

    async fn update_nameservers(&self, hostname: &str, nameservers: &[String]) -> Result<(), ProviderError>;
}
