//! Circuit breaker transitions.
//!
//! Pure functions over [`ShardHealthState`]; the store applies them under the
//! map's entry lock and replaces the whole record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use shardline_types::{ShardHealthState, ShardOutcome, MAX_PENALTY};

use crate::config::HealthConfig;

/// Fold one outcome into `current`, returning the replacement record.
///
/// A missing record is treated as pristine.
pub fn apply_outcome(
    current: Option<&ShardHealthState>,
    outcome: ShardOutcome,
    now: DateTime<Utc>,
    config: &HealthConfig,
) -> ShardHealthState {
    let mut next = current
        .cloned()
        .unwrap_or_else(|| ShardHealthState::fresh(now));

    match outcome {
        ShardOutcome::Success => {
            next.penalty = next.penalty.saturating_sub(1);
            if next.cooldown_until.is_some_and(|until| until <= now) {
                next.cooldown_until = None;
            }
            next.success_count = next.success_count.saturating_add(1);
        }
        ShardOutcome::RateLimited => {
            next.penalty = next.penalty.saturating_add(2).min(MAX_PENALTY);
            next.cooldown_until = Some(now + to_chrono(cooldown_for(outcome, next.penalty, config)));
            next.rate_limit_count = next.rate_limit_count.saturating_add(1);
        }
        ShardOutcome::Failure => {
            next.penalty = next.penalty.saturating_add(1).min(MAX_PENALTY);
            let until = now + to_chrono(cooldown_for(outcome, next.penalty, config));
            next.cooldown_until = Some(next.cooldown_until.map_or(until, |current| current.max(until)));
            next.failure_count = next.failure_count.saturating_add(1);
        }
    }

    next.last_outcome = Some(outcome);
    next.updated_at = now;
    next
}

/// Backoff for a negative outcome at the (already incremented) `penalty`.
///
/// `base * 2^(penalty-1)`, capped. Success carries no cooldown.
pub fn cooldown_for(outcome: ShardOutcome, penalty: u8, config: &HealthConfig) -> Duration {
    let (base, cap) = match outcome {
        ShardOutcome::Success => return Duration::ZERO,
        ShardOutcome::RateLimited => (config.rate_limit_base, config.rate_limit_cap),
        ShardOutcome::Failure => (config.failure_base, config.failure_cap),
    };
    let exponent = u32::from(penalty.max(1) - 1);
    base.saturating_mul(1u32 << exponent).min(cap)
}

/// Ranking multiplier for a shard's health; `1.0` when nothing is known.
pub fn health_multiplier(
    state: Option<&ShardHealthState>,
    now: DateTime<Utc>,
    config: &HealthConfig,
) -> f64 {
    let Some(state) = state else {
        return 1.0;
    };
    if state.is_cooling_down(now) {
        return config.cooldown_multiplier;
    }

    let mut multiplier =
        (1.0 - f64::from(state.penalty) * config.penalty_step).max(config.penalty_floor);

    if state.total_outcomes() >= config.instability_min_samples {
        let instability = state.instability();
        if instability > config.instability_threshold {
            multiplier *= (1.0 - instability).max(config.instability_floor);
        }
    }

    multiplier
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}
