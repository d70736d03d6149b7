//! Error types for the health crate.

use thiserror::Error;

/// Errors raised by health persistence and configuration.
#[derive(Debug, Error)]
pub enum HealthError {
    /// Durable storage rejected a read or write.
    #[error("health persistence error: {0}")]
    Persistence(String),

    /// A persisted row could not be mapped back to a health record.
    #[error("invalid health record: {0}")]
    InvalidRecord(String),

    /// Tuning values violate an ordering the breaker relies on.
    #[error("configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for health operations.
pub type HealthResult<T> = Result<T, HealthError>;
