// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status transition validation for workflows and jobs.
//!
//! The validator is a pure function over a fixed transition graph per kind.
//! The same table serves read-time checks (lint tooling) and write-time
//! enforcement; no hidden state is involved.
//!
//! Workflow graph:
//!
//! ```text
//! created → pending → queued → running → {finished, failed, stopped}
//!           pending → running                    (direct dispatch)
//!                     queued → failed            (admission rejection)
//!           any non-terminal → deleted           (administrative)
//! ```
//!
//! Job graph:
//!
//! ```text
//! created → running → {finished, failed, stopped}
//! ```
//!
//! Self-transitions are idempotent no-ops and always allowed, except from
//! terminal states, which reject every transition including self.

use serde::{Deserialize, Serialize};

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Run recorded but not yet submitted for scheduling.
    Created,
    /// Accepted; dispatches via the queue or straight to running.
    Pending,
    /// Admitted, waiting for the external scheduler to dequeue it.
    Queued,
    /// Jobs are executing.
    Running,
    /// All jobs completed successfully. Terminal.
    Finished,
    /// At least one job failed, or admission rejected the run. Terminal.
    Failed,
    /// Stopped on user request. Terminal.
    Stopped,
    /// Removed administratively. Terminal.
    Deleted,
}

impl WorkflowStatus {
    /// Stable lowercase name used in storage columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Created => "created",
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Queued => "queued",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Finished => "finished",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Stopped => "stopped",
            WorkflowStatus::Deleted => "deleted",
        }
    }

    /// Parse a storage column value back into a status.
    pub fn parse(s: &str) -> Option<WorkflowStatus> {
        match s {
            "created" => Some(WorkflowStatus::Created),
            "pending" => Some(WorkflowStatus::Pending),
            "queued" => Some(WorkflowStatus::Queued),
            "running" => Some(WorkflowStatus::Running),
            "finished" => Some(WorkflowStatus::Finished),
            "failed" => Some(WorkflowStatus::Failed),
            "stopped" => Some(WorkflowStatus::Stopped),
            "deleted" => Some(WorkflowStatus::Deleted),
            _ => None,
        }
    }

    /// Whether this status has no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        match self {
            WorkflowStatus::Created
            | WorkflowStatus::Pending
            | WorkflowStatus::Queued
            | WorkflowStatus::Running => false,
            WorkflowStatus::Finished
            | WorkflowStatus::Failed
            | WorkflowStatus::Stopped
            | WorkflowStatus::Deleted => true,
        }
    }

    /// Whether a transition from `self` to `requested` is allowed.
    pub fn can_transition_to(&self, requested: WorkflowStatus) -> bool {
        if *self == requested {
            return !self.is_terminal();
        }
        // Any non-terminal state may be deleted administratively.
        if requested == WorkflowStatus::Deleted {
            return !self.is_terminal();
        }
        match self {
            WorkflowStatus::Created => matches!(requested, WorkflowStatus::Pending),
            WorkflowStatus::Pending => {
                matches!(requested, WorkflowStatus::Queued | WorkflowStatus::Running)
            }
            WorkflowStatus::Queued => {
                matches!(requested, WorkflowStatus::Running | WorkflowStatus::Failed)
            }
            WorkflowStatus::Running => matches!(
                requested,
                WorkflowStatus::Finished | WorkflowStatus::Failed | WorkflowStatus::Stopped
            ),
            WorkflowStatus::Finished
            | WorkflowStatus::Failed
            | WorkflowStatus::Stopped
            | WorkflowStatus::Deleted => false,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a job within a workflow run.
///
/// Jobs have no queued/pending stage; the external scheduler launches them
/// directly from `created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job recorded but not yet launched.
    Created,
    /// Job is executing on a backend.
    Running,
    /// Job completed successfully. Terminal.
    Finished,
    /// Job failed. Terminal.
    Failed,
    /// Job stopped with its workflow. Terminal.
    Stopped,
}

impl JobStatus {
    /// Stable lowercase name used in storage columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        }
    }

    /// Parse a storage column value back into a status.
    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "created" => Some(JobStatus::Created),
            "running" => Some(JobStatus::Running),
            "finished" => Some(JobStatus::Finished),
            "failed" => Some(JobStatus::Failed),
            "stopped" => Some(JobStatus::Stopped),
            _ => None,
        }
    }

    /// Whether this status has no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        match self {
            JobStatus::Created | JobStatus::Running => false,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Stopped => true,
        }
    }

    /// Whether a transition from `self` to `requested` is allowed.
    pub fn can_transition_to(&self, requested: JobStatus) -> bool {
        if *self == requested {
            return !self.is_terminal();
        }
        match self {
            JobStatus::Created => matches!(requested, JobStatus::Running),
            JobStatus::Running => matches!(
                requested,
                JobStatus::Finished | JobStatus::Failed | JobStatus::Stopped
            ),
            JobStatus::Finished | JobStatus::Failed | JobStatus::Stopped => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which transition graph a validation request concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// Workflow run transitions.
    Workflow,
    /// Job transitions.
    Job,
}

impl StatusKind {
    /// Stable lowercase name for error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Workflow => "workflow",
            StatusKind::Job => "job",
        }
    }
}

/// Validate a status transition given raw status names.
///
/// Used for write-time enforcement on values read back from the store.
/// Unknown status names fail validation.
pub fn validate(kind: StatusKind, current: &str, requested: &str) -> bool {
    match kind {
        StatusKind::Workflow => match (WorkflowStatus::parse(current), WorkflowStatus::parse(requested)) {
            (Some(current), Some(requested)) => current.can_transition_to(requested),
            _ => false,
        },
        StatusKind::Job => match (JobStatus::parse(current), JobStatus::parse(requested)) {
            (Some(current), Some(requested)) => current.can_transition_to(requested),
            _ => false,
        },
    }
}
