//! Structured results of orchestrator operations.
//!
//! Public operations never return `Err`; callers tell success, degraded and
//! failed results apart by the variant (serialized as the `outcome` tag).

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::AgentEntry;
use crate::status::WorkerStatus;
use crate::util::BestEffort;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Dispatched { entry: AgentEntry },
    /// The task was already registered; nothing was done.
    Duplicate { entry: AgentEntry },
    Failed { task_id: String, error: String },
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, DispatchOutcome::Failed { .. })
    }

    pub fn entry(&self) -> Option<&AgentEntry> {
        match self {
            DispatchOutcome::Dispatched { entry } | DispatchOutcome::Duplicate { entry } => {
                Some(entry)
            }
            DispatchOutcome::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageSummary {
    pub role: String,
    pub text: String,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckReport {
    pub entry: AgentEntry,
    pub status: WorkerStatus,
    pub messages: Vec<MessageSummary>,
    /// `None` when no summary could be produced.
    pub diff: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegradedCheck {
    pub entry: AgentEntry,
    pub status: WorkerStatus,
    pub error: String,
    /// Recent pane output from the worker's tmux session.
    pub raw_output: BestEffort<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    Ok(CheckReport),
    Degraded(DegradedCheck),
    NotFound { task_id: String },
}

impl CheckOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, CheckOutcome::NotFound { .. })
    }
}

/// Outcome of a single request to a worker (followup, abort).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    Ok { task_id: String },
    NotFound { task_id: String },
    Failed { task_id: String, error: String },
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Ok { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStep {
    KillSession,
    RemoveWorkspace,
    UpdateTracker,
    Notify,
    Sync,
    Unregister,
    RemoveLog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepResult {
    Done,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub step: CleanupStep,
    pub result: StepResult,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupReport {
    pub task_id: String,
    pub final_status: String,
    pub steps: Vec<StepOutcome>,
}

impl CleanupReport {
    pub fn new(task_id: &str, final_status: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            final_status: final_status.to_string(),
            steps: Vec::new(),
        }
    }

    pub fn record(&mut self, step: CleanupStep, result: StepResult, note: impl Into<String>) {
        self.steps.push(StepOutcome {
            step,
            result,
            note: note.into(),
        });
    }

    pub fn step(&self, step: CleanupStep) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step == step)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| s.result == StepResult::Failed)
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CleanupOutcome {
    /// Every step was attempted; individual failures are in the report.
    Completed(CleanupReport),
    NotFound { task_id: String },
}

impl CleanupOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CleanupOutcome::Completed(report) if report.is_clean())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSummary {
    pub task_id: String,
    pub branch_label: String,
    pub control_port: u16,
    pub status: WorkerStatus,
    pub dispatched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedTask {
    pub task_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconstructReport {
    pub adopted: Vec<String>,
    pub already_tracked: Vec<String>,
    pub skipped: Vec<SkippedTask>,
}
