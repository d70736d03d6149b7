//! Shardline Registry - Shard inventory and assignment aggregates
//!
//! This crate answers two questions for the router:
//!
//! - **Which upstream accounts can serve sites?** [`ShardRegistry`] loads
//!   connection records, decrypts their credentials, resolves each to a
//!   canonical account and caches the resulting [`ShardCandidate`] set.
//! - **How loaded is each account?** [`AssignmentSnapshotCache`] aggregates
//!   live site assignments per account and per topical niche.
//!
//! Both caches expire on a short TTL and populate single-flight: concurrent
//! callers that miss together share one load.
//!
//! The collaborators ([`ConnectionStore`], [`CredentialCipher`],
//! [`AccountResolver`], [`AssignmentStore`]) are traits; in-memory
//! implementations for development and tests live in [`memory`].
//!
//! [`ShardCandidate`]: shardline_types::ShardCandidate

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod connection;
pub mod error;
pub mod memory;
pub mod registry;
pub mod snapshot;

// Re-exports
pub use connection::{
    AccountResolver, ConnectionRecord, ConnectionStore, CredentialCipher, ResolvedAccount,
    ShardConnectionConfig,
};
pub use error::{RegistryError, Result};
pub use memory::{
    InMemoryAccountResolver, InMemoryAssignmentStore, InMemoryConnectionStore,
    InMemoryCredentialCipher,
};
pub use registry::{ShardRegistry, DEFAULT_LOOKUP_TIMEOUT, DEFAULT_REGISTRY_TTL};
pub use snapshot::{candidate_fingerprint, AssignmentSnapshotCache, AssignmentStore, DEFAULT_SNAPSHOT_TTL};
