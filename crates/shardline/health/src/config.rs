//! Circuit breaker tuning.
//!
//! Defines backoff curves, multiplier floors and the stale/reload windows.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HealthError, HealthResult};

/// Configuration for shard health tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// First rate-limit cooldown; doubles per penalty point.
    pub rate_limit_base: Duration,

    /// Upper bound of a rate-limit cooldown.
    pub rate_limit_cap: Duration,

    /// First failure cooldown; doubles per penalty point.
    pub failure_base: Duration,

    /// Upper bound of a failure cooldown.
    pub failure_cap: Duration,

    /// Multiplier applied to a shard that is cooling down.
    pub cooldown_multiplier: f64,

    /// Multiplier lost per penalty point.
    pub penalty_step: f64,

    /// Floor of the penalty multiplier.
    pub penalty_floor: f64,

    /// Outcomes required before instability is considered.
    pub instability_min_samples: u64,

    /// Instability above which the extra damping applies.
    pub instability_threshold: f64,

    /// Floor of the instability damping factor.
    pub instability_floor: f64,

    /// Entries not updated for this long are purged.
    pub stale_after: Duration,

    /// Minimum interval between reloads from durable storage.
    pub reload_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            rate_limit_base: Duration::from_secs(15),
            rate_limit_cap: Duration::from_secs(10 * 60),
            failure_base: Duration::from_secs(5),
            failure_cap: Duration::from_secs(2 * 60),
            cooldown_multiplier: 0.05,
            penalty_step: 0.09,
            penalty_floor: 0.2,
            instability_min_samples: 20,
            instability_threshold: 0.25,
            instability_floor: 0.4,
            stale_after: Duration::from_secs(30 * 60),
            reload_interval: Duration::from_secs(60),
        }
    }
}

impl HealthConfig {
    /// Set the reload interval.
    pub fn with_reload_interval(mut self, interval: Duration) -> Self {
        self.reload_interval = interval;
        self
    }

    /// Check the orderings the breaker depends on.
    ///
    /// A cooling shard must always rank below the worst non-cooling shard,
    /// and every cooldown must end before its entry can go stale.
    pub fn validate(&self) -> HealthResult<()> {
        let worst_open = self.penalty_floor * self.instability_floor;
        if !(self.cooldown_multiplier > 0.0 && self.cooldown_multiplier < worst_open) {
            return Err(HealthError::ConfigurationError(format!(
                "cooldown multiplier {} must be in (0, {worst_open})",
                self.cooldown_multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.penalty_floor) || !(0.0..=1.0).contains(&self.instability_floor) {
            return Err(HealthError::ConfigurationError(
                "multiplier floors must be within [0, 1]".into(),
            ));
        }
        if self.rate_limit_cap.max(self.failure_cap) >= self.stale_after {
            return Err(HealthError::ConfigurationError(
                "stale window must exceed the longest cooldown".into(),
            ));
        }
        Ok(())
    }
}
