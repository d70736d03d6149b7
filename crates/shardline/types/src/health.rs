//! Per-shard health records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Penalty ceiling of the circuit breaker.
pub const MAX_PENALTY: u8 = 8;

/// Outcome of one deployment step attempted against a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardOutcome {
    Success,
    RateLimited,
    Failure,
}

impl ShardOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardOutcome::Success => "success",
            ShardOutcome::RateLimited => "rate_limited",
            ShardOutcome::Failure => "failure",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "success" => Some(ShardOutcome::Success),
            "rate_limited" => Some(ShardOutcome::RateLimited),
            "failure" => Some(ShardOutcome::Failure),
            _ => None,
        }
    }
}

impl fmt::Display for ShardOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable health of one (shard key, account) pair.
///
/// Values are replaced wholesale in the health map; readers never observe a
/// partially updated record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardHealthState {
    /// Circuit breaker penalty, always within `0..=MAX_PENALTY`.
    pub penalty: u8,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub rate_limit_count: u64,
    pub failure_count: u64,
    pub last_outcome: Option<ShardOutcome>,
    pub updated_at: DateTime<Utc>,
}

impl ShardHealthState {
    /// A pristine record, as created lazily on the first recorded outcome.
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            penalty: 0,
            cooldown_until: None,
            success_count: 0,
            rate_limit_count: 0,
            failure_count: 0,
            last_outcome: None,
            updated_at: now,
        }
    }

    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    pub fn total_outcomes(&self) -> u64 {
        self.success_count + self.rate_limit_count + self.failure_count
    }

    /// Share of observed outcomes that were rate limits or failures.
    pub fn instability(&self) -> f64 {
        let total = self.total_outcomes();
        if total == 0 {
            return 0.0;
        }
        (self.rate_limit_count + self.failure_count) as f64 / total as f64
    }
}
