// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for flowtide-db.
//!
//! This module defines the persistence abstraction and backend
//! implementations. The quota ledger operations (`get_usage`,
//! `increment_usage`, `set_usage`) live on the same trait as the entity
//! operations so every unit of work goes through one explicitly threaded
//! handle; there is no global session.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{ResourceType, SubjectRef};
use crate::run_number::RunNumber;

/// User record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRecord {
    /// Unique identifier for the user.
    pub id: Uuid,
    /// Unique email address.
    pub email: String,
    /// Display name.
    pub full_name: Option<String>,
    /// Maximum workflows this user may run simultaneously.
    /// `None` falls back to the configured default allowance.
    pub max_concurrent_workflows: Option<i32>,
    /// When the user was created.
    pub created_at: DateTime<Utc>,
}

/// Workflow run record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkflowRecord {
    /// Unique identifier for the run.
    pub id: Uuid,
    /// Logical workflow name; runs of one name+owner share a run-number
    /// sequence.
    pub name: String,
    /// Owning user.
    pub owner_id: Uuid,
    /// Current status (created, pending, queued, running, finished,
    /// failed, stopped, deleted).
    pub status: String,
    /// Major run version; increments when the minor range is exhausted.
    pub run_number_major: i32,
    /// Restart counter within the major version.
    pub run_number_minor: i32,
    /// Complexity pairs as a JSON array of `[multiplicity, weight]`.
    pub complexity: String,
    /// Workspace directory path, recorded by the workspace service.
    pub workspace_path: Option<String>,
    /// Last recorded workspace size in bytes.
    pub workspace_bytes: i64,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run entered `running`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run entered `finished` or `failed`.
    pub finished_at: Option<DateTime<Utc>>,
    /// When the run entered `stopped`.
    pub stopped_at: Option<DateTime<Utc>>,
}

impl WorkflowRecord {
    /// The run number of this record.
    pub fn run_number(&self) -> RunNumber {
        RunNumber::new(self.run_number_major, self.run_number_minor)
    }

    /// Full display name including the run number, e.g. `fit-sample.2.0`.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.name, self.run_number())
    }

    /// Decode the complexity column into `(multiplicity, weight)` pairs.
    pub fn complexity_pairs(&self) -> Result<Vec<(i64, i64)>, CoreError> {
        if self.complexity.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&self.complexity)?)
    }
}

/// Job record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    /// Unique identifier for the job.
    pub id: Uuid,
    /// Owning workflow run; jobs are deleted with their workflow.
    pub workflow_id: Uuid,
    /// Current status (created, running, finished, failed, stopped).
    pub status: String,
    /// Opaque identifier assigned once by the compute backend.
    pub backend_job_id: Option<String>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job entered `running`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Wall-clock CPU seconds consumed by this job, if it ran to an end.
    pub fn cpu_seconds(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => {
                Some((finished - started).num_seconds().max(0))
            }
            _ => None,
        }
    }
}

/// Quota ledger row from the persistence layer.
///
/// Keyed by `(subject_kind, subject_id, resource_type)` with upsert
/// semantics; `quota_used` never goes below zero.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QuotaRow {
    /// Whether the subject is a `user` or a `workflow`.
    pub subject_kind: String,
    /// The subject's identifier.
    pub subject_id: Uuid,
    /// Resource type name (`cpu` or `disk`).
    pub resource_type: String,
    /// Current usage in the resource's canonical unit.
    pub quota_used: i64,
    /// Configured limit; `NULL` or 0 means unlimited.
    pub quota_limit: Option<i64>,
    /// Last derived health classification.
    pub health: String,
    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
}

impl QuotaRow {
    /// Usage as an unsigned amount.
    pub fn used(&self) -> u64 {
        self.quota_used.max(0) as u64
    }

    /// Limit as an unsigned amount, if one is enforced.
    pub fn limit(&self) -> Option<u64> {
        match self.quota_limit {
            Some(limit) if limit > 0 => Some(limit as u64),
            _ => None,
        }
    }
}

/// Audit log record from the persistence layer. Append-only.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditLogRecord {
    /// Database primary key.
    pub id: i64,
    /// User who performed the action.
    pub actor_id: Uuid,
    /// Action kind (`quota_override`, `status_override`).
    pub action: String,
    /// Action details as JSON.
    pub details: Option<String>,
    /// When the action was recorded.
    pub created_at: DateTime<Utc>,
}

/// Persistence interface used by the lifecycle and quota components.
///
/// Ledger concurrency contract: `increment_usage` and `set_usage` for one
/// `(subject, resource)` key are serialized through a row-level lock (or
/// the store's write lock), so a job-completion increment racing a
/// reconciliation pass never loses an update. Different subjects are
/// independent.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ========================================================================
    // Users
    // ========================================================================

    /// Insert a user record.
    async fn create_user(&self, user: &UserRecord) -> Result<(), CoreError>;

    /// Get a user by ID.
    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserRecord>, CoreError>;

    // ========================================================================
    // Workflows
    // ========================================================================

    /// Insert a workflow run record.
    async fn insert_workflow(&self, workflow: &WorkflowRecord) -> Result<(), CoreError>;

    /// Get a workflow run by ID.
    async fn get_workflow(&self, workflow_id: Uuid) -> Result<Option<WorkflowRecord>, CoreError>;

    /// The highest `(major, minor)` run number recorded for a logical
    /// workflow, under lexical order.
    async fn latest_run_number(
        &self,
        name: &str,
        owner_id: Uuid,
    ) -> Result<Option<RunNumber>, CoreError>;

    /// Update a workflow's status and any lifecycle timestamps that the
    /// transition sets.
    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: &str,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
        stopped_at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError>;

    /// Delete a workflow run, cascading to its jobs and quota rows.
    async fn delete_workflow(&self, workflow_id: Uuid) -> Result<(), CoreError>;

    /// Count a user's workflows currently `pending` or `running`.
    async fn count_active_workflows(&self, owner_id: Uuid) -> Result<i64, CoreError>;

    /// Record the workspace byte count reported by the workspace service.
    async fn set_workspace_bytes(&self, workflow_id: Uuid, bytes: i64) -> Result<(), CoreError>;

    // ========================================================================
    // Jobs
    // ========================================================================

    /// Insert a job record.
    async fn insert_job(&self, job: &JobRecord) -> Result<(), CoreError>;

    /// Get a job by ID.
    async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, CoreError>;

    /// Update a job's status and any lifecycle timestamps that the
    /// transition sets.
    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: &str,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError>;

    /// Assign the backend job ID. Returns false if one is already set;
    /// the field is immutable after first assignment.
    async fn set_backend_job_id(
        &self,
        job_id: Uuid,
        backend_job_id: &str,
    ) -> Result<bool, CoreError>;

    // ========================================================================
    // Quota Ledger
    // ========================================================================

    /// Current usage for a subject and resource. Missing rows read as 0.
    async fn get_usage(&self, subject: SubjectRef, resource: ResourceType)
    -> Result<u64, CoreError>;

    /// Apply a delta to a subject's usage, clamping at zero.
    ///
    /// The only ledger write permitted on the hot path. Returns true when
    /// the delta was clamped, so callers can count clamps in metrics;
    /// clamping itself is an expected eventual-consistency artifact, not
    /// an error.
    async fn increment_usage(
        &self,
        subject: SubjectRef,
        resource: ResourceType,
        delta: i64,
    ) -> Result<bool, CoreError>;

    /// Overwrite a subject's usage with a freshly sampled value.
    ///
    /// Reserved for reconciliation passes; idempotent for equal inputs.
    async fn set_usage(
        &self,
        subject: SubjectRef,
        resource: ResourceType,
        amount: u64,
    ) -> Result<(), CoreError>;

    /// Set or clear the limit for a subject and resource.
    async fn set_quota_limit(
        &self,
        subject: SubjectRef,
        resource: ResourceType,
        limit: Option<u64>,
    ) -> Result<(), CoreError>;

    /// Store the derived health classification for operators and UI
    /// readers.
    async fn set_quota_health(
        &self,
        subject: SubjectRef,
        resource: ResourceType,
        health: &str,
    ) -> Result<(), CoreError>;

    /// Get one quota row.
    async fn get_quota_row(
        &self,
        subject: SubjectRef,
        resource: ResourceType,
    ) -> Result<Option<QuotaRow>, CoreError>;

    /// Get all quota rows for a subject.
    async fn list_quota_rows(&self, subject: SubjectRef) -> Result<Vec<QuotaRow>, CoreError>;

    // ========================================================================
    // Updater support
    // ========================================================================

    /// Enumerate subjects eligible for a reconciliation pass.
    ///
    /// With `active_since`, only workflows with lifecycle activity at or
    /// after the timestamp (and their owners) are returned; otherwise all
    /// users and all non-deleted workflows.
    async fn list_quota_subjects(
        &self,
        active_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SubjectRef>, CoreError>;

    // ========================================================================
    // Usage sampling
    // ========================================================================

    /// True CPU-seconds consumed by a subject: the summed wall-clock
    /// runtime of its terminal jobs.
    async fn sampled_cpu_seconds(&self, subject: SubjectRef) -> Result<i64, CoreError>;

    /// True disk consumption of a subject: recorded workspace byte counts,
    /// summed over a user's non-deleted workflows.
    async fn sampled_workspace_bytes(&self, subject: SubjectRef) -> Result<i64, CoreError>;

    // ========================================================================
    // Audit
    // ========================================================================

    /// Append an audit log entry. Write-once; never updated.
    async fn insert_audit_log(
        &self,
        actor_id: Uuid,
        action: &str,
        details: Option<&serde_json::Value>,
    ) -> Result<(), CoreError>;

    /// List an actor's audit log entries, newest first.
    async fn list_audit_logs(&self, actor_id: Uuid) -> Result<Vec<AuditLogRecord>, CoreError>;

    // ========================================================================
    // Health
    // ========================================================================

    /// Check that the store is reachable.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
