// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow and job lifecycle operations.
//!
//! This is the write path callers go through: every status change is
//! gated by the transition validator, lifecycle timestamps are maintained
//! alongside the status column, and terminal transitions feed the quota
//! ledger so usage stays close to the truth between reconciliation
//! passes.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::error::CoreError;
use crate::model::{AuditLogAction, QuotaHealth, ResourceType, SubjectRef, complexity_scalar};
use crate::persistence::{JobRecord, Persistence, UserRecord, WorkflowRecord};
use crate::priority::PriorityWeights;
use crate::quota::{HealthBands, QuotaReport};
use crate::run_number::next_run_number;
use crate::status::{JobStatus, WorkflowStatus};

/// High-level lifecycle operations over a persistence backend.
pub struct Lifecycle {
    persistence: Arc<dyn Persistence>,
    bands: HealthBands,
    weights: PriorityWeights,
    max_restarts_per_major: u32,
    default_cpu_limit: u64,
    default_disk_limit: u64,
    default_concurrency_allowance: u32,
}

impl Lifecycle {
    /// Create a lifecycle layer from configuration.
    pub fn new(persistence: Arc<dyn Persistence>, config: &Config) -> Self {
        Self {
            persistence,
            bands: config.health_bands,
            weights: config.priority_weights,
            max_restarts_per_major: config.max_restarts_per_major,
            default_cpu_limit: config.default_cpu_limit,
            default_disk_limit: config.default_disk_limit,
            default_concurrency_allowance: config.default_concurrency_allowance,
        }
    }

    /// Access the underlying persistence handle.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Create a user and seed their quota limits from the configured
    /// defaults. A default of zero means unlimited and writes no limit.
    #[instrument(skip(self))]
    pub async fn create_user(
        &self,
        email: &str,
        full_name: Option<String>,
        max_concurrent_workflows: Option<i32>,
    ) -> Result<UserRecord, CoreError> {
        if !email.contains('@') {
            return Err(CoreError::ValidationError {
                field: "email".to_string(),
                message: format!("'{}' is not a valid email address", email),
            });
        }

        let user = UserRecord {
            id: Uuid::new_v4(),
            email: email.to_string(),
            full_name,
            max_concurrent_workflows,
            created_at: Utc::now(),
        };
        self.persistence.create_user(&user).await?;

        let subject = SubjectRef::user(user.id);
        if self.default_cpu_limit > 0 {
            self.persistence
                .set_quota_limit(subject, ResourceType::Cpu, Some(self.default_cpu_limit))
                .await?;
        }
        if self.default_disk_limit > 0 {
            self.persistence
                .set_quota_limit(subject, ResourceType::Disk, Some(self.default_disk_limit))
                .await?;
        }

        info!(user_id = %user.id, email = %user.email, "Created user");
        Ok(user)
    }

    // ========================================================================
    // Workflows
    // ========================================================================

    /// Create a new workflow run.
    ///
    /// Assigns the next run number in the `(major, minor)` sequence for
    /// this name and owner. The run starts in `created` status.
    #[instrument(skip(self, complexity))]
    pub async fn create_workflow(
        &self,
        name: &str,
        owner_id: Uuid,
        complexity: &[(i64, i64)],
        workspace_path: Option<String>,
    ) -> Result<WorkflowRecord, CoreError> {
        if name.is_empty() || name.contains('.') {
            return Err(CoreError::ValidationError {
                field: "name".to_string(),
                message: "workflow name must be non-empty and must not contain '.'".to_string(),
            });
        }
        if self.persistence.get_user(owner_id).await?.is_none() {
            return Err(CoreError::UserNotFound {
                user_id: owner_id.to_string(),
            });
        }

        let previous = self.persistence.latest_run_number(name, owner_id).await?;
        let run_number = next_run_number(previous, self.max_restarts_per_major);

        let workflow = WorkflowRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            owner_id,
            status: WorkflowStatus::Created.as_str().to_string(),
            run_number_major: run_number.major,
            run_number_minor: run_number.minor,
            complexity: serde_json::to_string(complexity)?,
            workspace_path,
            workspace_bytes: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            stopped_at: None,
        };
        self.persistence.insert_workflow(&workflow).await?;

        info!(
            workflow_id = %workflow.id,
            name = %workflow.full_name(),
            "Created workflow run"
        );
        Ok(workflow)
    }

    /// Restart a terminal workflow run as a new run of the same logical
    /// workflow.
    ///
    /// The new run inherits name, owner, complexity and workspace path
    /// and takes the next run number. Exhausting the minor range rolls
    /// over to the next major; that rollover is a normal outcome.
    #[instrument(skip(self))]
    pub async fn restart_workflow(&self, workflow_id: Uuid) -> Result<WorkflowRecord, CoreError> {
        let previous = self.get_workflow(workflow_id).await?;
        let status = parse_workflow_status(&previous.status)?;

        if !matches!(
            status,
            WorkflowStatus::Finished | WorkflowStatus::Failed | WorkflowStatus::Stopped
        ) {
            return Err(CoreError::InvalidTransition {
                kind: "workflow",
                current: previous.status.clone(),
                requested: "restarted".to_string(),
            });
        }

        let latest = self
            .persistence
            .latest_run_number(&previous.name, previous.owner_id)
            .await?;
        let run_number = next_run_number(latest, self.max_restarts_per_major);
        if let Some(latest) = latest
            && latest.next_rolls_over(self.max_restarts_per_major)
        {
            info!(
                name = %previous.name,
                from = %latest,
                to = %run_number,
                "Restart limit reached for major version, rolling over"
            );
        }

        let workflow = WorkflowRecord {
            id: Uuid::new_v4(),
            name: previous.name.clone(),
            owner_id: previous.owner_id,
            status: WorkflowStatus::Created.as_str().to_string(),
            run_number_major: run_number.major,
            run_number_minor: run_number.minor,
            complexity: previous.complexity.clone(),
            workspace_path: previous.workspace_path.clone(),
            workspace_bytes: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            stopped_at: None,
        };
        self.persistence.insert_workflow(&workflow).await?;

        info!(
            workflow_id = %workflow.id,
            name = %workflow.full_name(),
            restarted_from = %workflow_id,
            "Restarted workflow"
        );
        Ok(workflow)
    }

    /// Change a workflow's status through the transition validator.
    ///
    /// Maintains lifecycle timestamps and, on terminal transitions,
    /// reconciles the disk ledger for the run and its owner so quota
    /// reads stay current between updater passes.
    #[instrument(skip(self))]
    pub async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        requested: WorkflowStatus,
    ) -> Result<WorkflowRecord, CoreError> {
        let workflow = self.get_workflow(workflow_id).await?;
        let current = parse_workflow_status(&workflow.status)?;

        if !current.can_transition_to(requested) {
            return Err(CoreError::InvalidTransition {
                kind: "workflow",
                current: current.as_str().to_string(),
                requested: requested.as_str().to_string(),
            });
        }

        let now = Utc::now();
        let started_at = matches!(requested, WorkflowStatus::Running).then_some(now);
        let finished_at =
            matches!(requested, WorkflowStatus::Finished | WorkflowStatus::Failed).then_some(now);
        let stopped_at = matches!(requested, WorkflowStatus::Stopped).then_some(now);

        self.persistence
            .update_workflow_status(workflow_id, requested.as_str(), started_at, finished_at, stopped_at)
            .await?;

        if requested.is_terminal() {
            self.reconcile_disk(&workflow).await?;
        }

        debug!(
            workflow_id = %workflow_id,
            from = current.as_str(),
            to = requested.as_str(),
            "Workflow status updated"
        );
        self.get_workflow(workflow_id).await
    }

    /// Delete a workflow run and its dependent records, then reconcile
    /// the owner's disk ledger without the deleted workspace.
    #[instrument(skip(self))]
    pub async fn delete_workflow(&self, workflow_id: Uuid) -> Result<(), CoreError> {
        let workflow = self.get_workflow(workflow_id).await?;
        let current = parse_workflow_status(&workflow.status)?;

        if !current.can_transition_to(WorkflowStatus::Deleted) {
            return Err(CoreError::InvalidTransition {
                kind: "workflow",
                current: current.as_str().to_string(),
                requested: WorkflowStatus::Deleted.as_str().to_string(),
            });
        }

        self.persistence.delete_workflow(workflow_id).await?;
        self.reconcile_subject_disk(SubjectRef::user(workflow.owner_id))
            .await?;

        info!(workflow_id = %workflow_id, name = %workflow.full_name(), "Deleted workflow");
        Ok(())
    }

    /// Record the workspace size reported by the workspace service.
    pub async fn record_workspace_bytes(
        &self,
        workflow_id: Uuid,
        bytes: i64,
    ) -> Result<(), CoreError> {
        // Verify the workflow exists so a stale report surfaces as an error.
        self.get_workflow(workflow_id).await?;
        self.persistence
            .set_workspace_bytes(workflow_id, bytes.max(0))
            .await
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    /// Create a job under a workflow run.
    pub async fn create_job(&self, workflow_id: Uuid) -> Result<JobRecord, CoreError> {
        self.get_workflow(workflow_id).await?;

        let job = JobRecord {
            id: Uuid::new_v4(),
            workflow_id,
            status: JobStatus::Created.as_str().to_string(),
            backend_job_id: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.persistence.insert_job(&job).await?;
        Ok(job)
    }

    /// Change a job's status through the transition validator.
    ///
    /// A job may not start while its workflow is stopped or terminal.
    /// When the job reaches a terminal status its wall-clock runtime is
    /// added to the CPU ledgers of the workflow and its owner.
    #[instrument(skip(self))]
    pub async fn update_job_status(
        &self,
        job_id: Uuid,
        requested: JobStatus,
    ) -> Result<JobRecord, CoreError> {
        let job = self.get_job(job_id).await?;
        let current = parse_job_status(&job.status)?;

        if !current.can_transition_to(requested) {
            return Err(CoreError::InvalidTransition {
                kind: "job",
                current: current.as_str().to_string(),
                requested: requested.as_str().to_string(),
            });
        }

        let workflow = self.get_workflow(job.workflow_id).await?;
        let workflow_status = parse_workflow_status(&workflow.status)?;
        if requested == JobStatus::Running && workflow_status.is_terminal() {
            return Err(CoreError::ValidationError {
                field: "status".to_string(),
                message: format!(
                    "job cannot start while its workflow is {}",
                    workflow_status.as_str()
                ),
            });
        }

        let now = Utc::now();
        let started_at = matches!(requested, JobStatus::Running).then_some(now);
        let finished_at = requested.is_terminal().then_some(now);

        self.persistence
            .update_job_status(job_id, requested.as_str(), started_at, finished_at)
            .await?;

        let job = self.get_job(job_id).await?;
        if requested.is_terminal() && !current.is_terminal()
            && let Some(cpu_seconds) = job.cpu_seconds()
            && cpu_seconds > 0
        {
            self.persistence
                .increment_usage(
                    SubjectRef::workflow(job.workflow_id),
                    ResourceType::Cpu,
                    cpu_seconds,
                )
                .await?;
            self.persistence
                .increment_usage(
                    SubjectRef::user(workflow.owner_id),
                    ResourceType::Cpu,
                    cpu_seconds,
                )
                .await?;
            debug!(
                job_id = %job_id,
                cpu_seconds,
                "Charged job runtime to CPU ledgers"
            );
        }

        Ok(job)
    }

    /// Assign the compute backend's job identifier. The field is
    /// write-once; a second assignment fails.
    pub async fn set_backend_job_id(
        &self,
        job_id: Uuid,
        backend_job_id: &str,
    ) -> Result<(), CoreError> {
        self.get_job(job_id).await?;
        let assigned = self
            .persistence
            .set_backend_job_id(job_id, backend_job_id)
            .await?;
        if !assigned {
            return Err(CoreError::ValidationError {
                field: "backend_job_id".to_string(),
                message: "backend job ID is already assigned".to_string(),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Quota
    // ========================================================================

    /// Set or clear a quota limit on behalf of an administrator.
    ///
    /// Recomputes the stored health against the new limit and appends an
    /// audit log entry naming the actor.
    #[instrument(skip(self))]
    pub async fn override_quota_limit(
        &self,
        actor_id: Uuid,
        subject: SubjectRef,
        resource: ResourceType,
        limit: Option<u64>,
    ) -> Result<(), CoreError> {
        self.persistence
            .set_quota_limit(subject, resource, limit)
            .await?;

        let used = self.persistence.get_usage(subject, resource).await?;
        let health = self.bands.classify(used, limit.filter(|limit| *limit > 0));
        self.persistence
            .set_quota_health(subject, resource, health.as_str())
            .await?;

        let details = serde_json::json!({
            "subject": subject.to_string(),
            "resource": resource.as_str(),
            "limit": limit,
        });
        self.persistence
            .insert_audit_log(actor_id, AuditLogAction::QuotaOverride.as_str(), Some(&details))
            .await?;

        info!(actor_id = %actor_id, subject = %subject, resource = resource.as_str(), "Quota limit overridden");
        Ok(())
    }

    /// Force a workflow status outside the transition graph, for operator
    /// repair of stuck runs. Audited with the acting administrator.
    #[instrument(skip(self))]
    pub async fn override_workflow_status(
        &self,
        actor_id: Uuid,
        workflow_id: Uuid,
        requested: WorkflowStatus,
    ) -> Result<WorkflowRecord, CoreError> {
        let workflow = self.get_workflow(workflow_id).await?;

        self.persistence
            .update_workflow_status(workflow_id, requested.as_str(), None, None, None)
            .await?;

        let details = serde_json::json!({
            "workflow_id": workflow_id.to_string(),
            "from": workflow.status,
            "to": requested.as_str(),
        });
        self.persistence
            .insert_audit_log(actor_id, AuditLogAction::StatusOverride.as_str(), Some(&details))
            .await?;

        info!(actor_id = %actor_id, workflow_id = %workflow_id, to = requested.as_str(), "Workflow status overridden");
        self.get_workflow(workflow_id).await
    }

    /// Whether any of the subject's quotas is exceeded. Used as an
    /// admission gate before accepting new work.
    pub async fn has_exceeded_quota(&self, subject: SubjectRef) -> Result<bool, CoreError> {
        let rows = self.persistence.list_quota_rows(subject).await?;
        Ok(rows.iter().any(|row| {
            self.bands.classify(row.used(), row.limit()) == QuotaHealth::Exceeded
        }))
    }

    /// Derived quota views for a subject, one per ledger row.
    pub async fn quota_reports(&self, subject: SubjectRef) -> Result<Vec<QuotaReport>, CoreError> {
        let rows = self.persistence.list_quota_rows(subject).await?;
        let mut reports = Vec::with_capacity(rows.len());
        for row in rows {
            let resource =
                ResourceType::parse(&row.resource_type).ok_or(CoreError::ValidationError {
                    field: "resource_type".to_string(),
                    message: format!("unknown resource type '{}'", row.resource_type),
                })?;
            reports.push(QuotaReport::new(resource, row.used(), row.limit(), &self.bands));
        }
        Ok(reports)
    }

    // ========================================================================
    // Priority
    // ========================================================================

    /// Scheduling priority for a workflow run; higher sorts first.
    pub async fn priority(&self, workflow_id: Uuid) -> Result<i32, CoreError> {
        let workflow = self.get_workflow(workflow_id).await?;
        let owner = self
            .persistence
            .get_user(workflow.owner_id)
            .await?
            .ok_or(CoreError::UserNotFound {
                user_id: workflow.owner_id.to_string(),
            })?;

        let complexity = complexity_scalar(&workflow.complexity_pairs()?);
        let allowance = owner
            .max_concurrent_workflows
            .map(|allowance| allowance.max(0) as u32)
            .unwrap_or(self.default_concurrency_allowance);
        let running = self
            .persistence
            .count_active_workflows(workflow.owner_id)
            .await?
            .max(0) as u32;

        Ok(self.weights.priority(complexity, running, allowance))
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowRecord, CoreError> {
        self.persistence
            .get_workflow(workflow_id)
            .await?
            .ok_or(CoreError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            })
    }

    async fn get_job(&self, job_id: Uuid) -> Result<JobRecord, CoreError> {
        self.persistence
            .get_job(job_id)
            .await?
            .ok_or(CoreError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Overwrite the disk ledger entries touched by a workflow reaching a
    /// terminal status: the run itself and its owner.
    async fn reconcile_disk(&self, workflow: &WorkflowRecord) -> Result<(), CoreError> {
        self.reconcile_subject_disk(SubjectRef::workflow(workflow.id))
            .await?;
        self.reconcile_subject_disk(SubjectRef::user(workflow.owner_id))
            .await
    }

    async fn reconcile_subject_disk(&self, subject: SubjectRef) -> Result<(), CoreError> {
        let bytes = self.persistence.sampled_workspace_bytes(subject).await?;
        self.persistence
            .set_usage(subject, ResourceType::Disk, bytes.max(0) as u64)
            .await?;

        let limit = self
            .persistence
            .get_quota_row(subject, ResourceType::Disk)
            .await?
            .and_then(|row| row.limit());
        let health = self.bands.classify(bytes.max(0) as u64, limit);
        self.persistence
            .set_quota_health(subject, ResourceType::Disk, health.as_str())
            .await
    }
}

fn parse_workflow_status(s: &str) -> Result<WorkflowStatus, CoreError> {
    WorkflowStatus::parse(s).ok_or_else(|| CoreError::ValidationError {
        field: "status".to_string(),
        message: format!("unknown workflow status '{}'", s),
    })
}

fn parse_job_status(s: &str) -> Result<JobStatus, CoreError> {
    JobStatus::parse(s).ok_or_else(|| CoreError::ValidationError {
        field: "status".to_string(),
        message: format!("unknown job status '{}'", s),
    })
}
