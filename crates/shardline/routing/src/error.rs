//! Routing error types

use shardline_registry::RegistryError;
use thiserror::Error;

/// Errors that fail a whole plan.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// No shard connection resolved and no environment default is configured.
    #[error("no shard candidates available: connect a hosting account or set a default account")]
    NoCandidates,

    /// The shard registry could not be loaded.
    #[error("shard registry unavailable: {0}")]
    Registry(#[from] RegistryError),
}

/// Result type for routing operations.
pub type Result<T> = std::result::Result<T, RoutingError>;
