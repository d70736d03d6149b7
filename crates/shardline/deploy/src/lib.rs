//! # Shardline Deploy - Multi-step site deployment with shard failover
//!
//! Runs the four-step deployment pipeline for a site against the shard plan
//! produced by `shardline-routing`:
//!
//! 1. **Generate Files**: no shard involved; empty output is fatal
//! 2. **Upload**: create or reuse the provider project and upload, failing
//!    over through the plan on rate limits, timeouts and server faults
//! 3. **Link Custom Domain**: on the shard that accepted the upload
//! 4. **Update Registrar DNS**: best effort; never fails the job
//!
//! Every shard touched reports its outcome to the shared health store, and
//! the step trace is written to the job record after each transition.
//!
//! ## Key Components
//!
//! - [`Orchestrator`]: runs one job and returns a [`DeployReport`]
//! - [`DeployWorker`]: claims queued jobs and runs them concurrently
//! - [`ShardlineConfig`]: `SHARDLINE_*` environment configuration
//! - [`provider`]: collaborator traits and failure classification
//! - [`memory`]: scriptable in-memory collaborators for tests
//!
//! ## Example
//!
//! ```rust,ignore
//! let orchestrator = Orchestrator::new(planner, generator, provider, domains, jobs.clone())
//!     .with_registrar(registrar)
//!     .with_settings(config.orchestrator_settings());
//! let worker = DeployWorker::new(Arc::new(orchestrator), jobs, config.max_concurrent_jobs());
//! worker.run().await;
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod best_effort;
pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod orchestrator;
pub mod provider;
pub mod store;
pub mod worker;

pub use best_effort::{BestEffort, SideEffect, SideEffectKind};
pub use config::ShardlineConfig;
pub use context::{sanitize_project_name, CancellationFlag, DeployContext, ShardAttempt};
pub use error::{DeployError, Result};
pub use orchestrator::{DeployReport, Orchestrator, OrchestratorSettings, CANCELLED_MESSAGE};
pub use provider::{
    classify_failure, FailureClass, HostingProvider, ProviderError, ProviderProject, Registrar,
    SiteFile, SiteGenerator,
};
pub use store::{
    DeployJob, DeployPayload, DeploymentRecord, DomainRecord, DomainStore, JobStore, JobUpdate,
};
pub use worker::DeployWorker;
