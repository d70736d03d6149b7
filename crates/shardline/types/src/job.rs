//! Deploy job step trace

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    GenerateFiles,
    Upload,
    LinkCustomDomain,
    UpdateDns,
}

impl StepName {
    pub const ALL: [StepName; 4] = [
        StepName::GenerateFiles,
        StepName::Upload,
        StepName::LinkCustomDomain,
        StepName::UpdateDns,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            StepName::GenerateFiles => "Generate Files",
            StepName::Upload => "Upload",
            StepName::LinkCustomDomain => "Link Custom Domain",
            StepName::UpdateDns => "Update Registrar DNS",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl StepStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Failed)
    }
}

/// One entry of a job's step trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployStep {
    pub name: StepName,
    pub status: StepStatus,
    pub detail: Option<String>,
}

impl DeployStep {
    pub fn pending(name: StepName) -> Self {
        Self {
            name,
            status: StepStatus::Pending,
            detail: None,
        }
    }

    /// The full four-step trace in its initial state.
    pub fn initial_trace() -> Vec<DeployStep> {
        StepName::ALL.iter().copied().map(Self::pending).collect()
    }
}

/// Job-level status stored on the job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        })
    }
}
