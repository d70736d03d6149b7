//! Registry error types

use thiserror::Error;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Connection store error: {0}")]
    ConnectionStore(String),

    #[error("Credential decryption failed: {0}")]
    Decrypt(String),

    #[error("Account resolution failed: {0}")]
    AccountResolution(String),

    #[error("Assignment store error: {0}")]
    AssignmentStore(String),

    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: std::time::Duration,
    },
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;
