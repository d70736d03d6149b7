//! # Shardline Health - Circuit breaker for upstream accounts
//!
//! Every deployment step attempted against a shard reports back one
//! [`ShardOutcome`]. This crate folds those outcomes into a per-shard
//! [`ShardHealthState`] (penalty, cooldown, rolling counters) and turns the
//! state into a ranking multiplier for the router.
//!
//! ## Key Components
//!
//! - [`breaker`]: pure state transitions and the health multiplier
//! - [`ShardHealthStore`]: concurrent in-memory map with lazy stale purge and
//!   periodic reload from durable storage
//! - [`persistence`]: the durable-storage trait, an in-memory backend, a
//!   PostgreSQL backend (`postgres` feature) and the write-behind queue
//!
//! ## Persistence Is Best-Effort
//!
//! Outcomes are applied to memory synchronously and handed to a background
//! writer with a bounded queue. A failing or hung database never blocks
//! routing: each write has a deadline, and writes arriving while the queue
//! is full are dropped. Both are logged and counted in [`WriteBehindStats`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shardline_health::{HealthConfig, InMemoryHealthPersistence, ShardHealthStore};
//! use shardline_types::{AccountId, ShardIdentity, ShardKey, ShardOutcome};
//!
//! # async fn example() {
//! let persistence = Arc::new(InMemoryHealthPersistence::new());
//! let store = ShardHealthStore::with_persistence(HealthConfig::default(), persistence);
//!
//! let shard = ShardIdentity::new(ShardKey::new("east-1"), AccountId::new("acct"));
//! store.record_outcome(&shard, ShardOutcome::RateLimited);
//! assert!(store.is_cooling_down(&shard));
//! # }
//! ```
//!
//! [`ShardOutcome`]: shardline_types::ShardOutcome
//! [`ShardHealthState`]: shardline_types::ShardHealthState

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod breaker;
pub mod config;
pub mod error;
pub mod persistence;
pub mod store;

pub use breaker::{apply_outcome, cooldown_for, health_multiplier};
pub use config::HealthConfig;
pub use error::{HealthError, HealthResult};
pub use persistence::{
    HealthPersistence, HealthUpsert, HealthWriteBehind, InMemoryHealthPersistence,
    WriteBehindStats, UPSERT_TIMEOUT, WRITE_QUEUE_CAPACITY,
};
#[cfg(feature = "postgres")]
pub use persistence::postgres::PostgresHealthPersistence;
pub use store::ShardHealthStore;
