//! Explicit best-effort side effects
//!
//! Some pipeline side effects must never fail a job: DNS updates, lifecycle
//! transitions, the deployed-flag rollback and job-record writes. Their
//! results are kept as [`BestEffort`] values on the run report instead of
//! being dropped, so callers and tests can see what was attempted.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum BestEffort<T> {
    Done(T),
    Skipped(String),
    Failed(String),
}

impl<T> BestEffort<T> {
    pub fn from_result<E: fmt::Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => BestEffort::Done(value),
            Err(e) => BestEffort::Failed(e.to_string()),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        BestEffort::Skipped(reason.into())
    }

    pub fn is_done(&self) -> bool {
        matches!(self, BestEffort::Done(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, BestEffort::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, BestEffort::Skipped(_))
    }
}

/// Which side effect a [`BestEffort`] result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectKind {
    UpdateDns,
    AdvanceLifecycle,
    RollbackDeployed,
    JobRecordWrite,
}

impl fmt::Display for SideEffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SideEffectKind::UpdateDns => "update_dns",
            SideEffectKind::AdvanceLifecycle => "advance_lifecycle",
            SideEffectKind::RollbackDeployed => "rollback_deployed",
            SideEffectKind::JobRecordWrite => "job_record_write",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEffect {
    pub kind: SideEffectKind,
    pub result: BestEffort<String>,
}

impl SideEffect {
    pub fn new(kind: SideEffectKind, result: BestEffort<String>) -> Self {
        Self { kind, result }
    }
}
