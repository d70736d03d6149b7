//! Deployment error types

use shardline_health::HealthError;
use shardline_routing::RoutingError;
use shardline_types::DomainId;
use thiserror::Error;

/// Deployment errors
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Domain not found: {}", .0.as_str())]
    DomainNotFound(DomainId),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Domain store error: {0}")]
    DomainStore(String),

    #[error("Job store error: {0}")]
    JobStore(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker error: {0}")]
    Worker(String),
}

impl From<HealthError> for DeployError {
    fn from(e: HealthError) -> Self {
        DeployError::Config(e.to_string())
    }
}

impl From<config::ConfigError> for DeployError {
    fn from(e: config::ConfigError) -> Self {
        DeployError::Config(e.to_string())
    }
}

/// Result type for deployment operations
pub type Result<T> = std::result::Result<T, DeployError>;
