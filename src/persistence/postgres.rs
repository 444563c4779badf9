// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.
//!
//! The production backend. Ledger writes take a row-level lock
//! (`SELECT ... FOR UPDATE`) so concurrent increments for the same
//! `(subject, resource)` key serialize without losing updates.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{ResourceType, SubjectKind, SubjectRef};
use crate::run_number::RunNumber;

use super::sqlite::sum_cpu_seconds;
use super::{AuditLogRecord, JobRecord, Persistence, QuotaRow, UserRecord, WorkflowRecord};

/// PostgreSQL-backed persistence provider.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new PostgreSQL persistence provider from an existing pool.
    ///
    /// The caller is responsible for running migrations
    /// (see [`crate::migrations::run_postgres`]).
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn create_user(&self, user: &UserRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, full_name, max_concurrent_workflows, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.full_name)
        .bind(user.max_concurrent_workflows)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserRecord>, CoreError> {
        let record = sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT id, email, full_name, max_concurrent_workflows, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn insert_workflow(&self, workflow: &WorkflowRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, owner_id, status,
                                   run_number_major, run_number_minor, complexity,
                                   workspace_path, workspace_bytes,
                                   created_at, started_at, finished_at, stopped_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(workflow.id)
        .bind(&workflow.name)
        .bind(workflow.owner_id)
        .bind(&workflow.status)
        .bind(workflow.run_number_major)
        .bind(workflow.run_number_minor)
        .bind(&workflow.complexity)
        .bind(&workflow.workspace_path)
        .bind(workflow.workspace_bytes)
        .bind(workflow.created_at)
        .bind(workflow.started_at)
        .bind(workflow.finished_at)
        .bind(workflow.stopped_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<Option<WorkflowRecord>, CoreError> {
        let record = sqlx::query_as::<_, WorkflowRecord>(
            r#"
            SELECT id, name, owner_id, status,
                   run_number_major, run_number_minor, complexity,
                   workspace_path, workspace_bytes,
                   created_at, started_at, finished_at, stopped_at
            FROM workflows
            WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn latest_run_number(
        &self,
        name: &str,
        owner_id: Uuid,
    ) -> Result<Option<RunNumber>, CoreError> {
        let row: Option<(i32, i32)> = sqlx::query_as(
            r#"
            SELECT run_number_major, run_number_minor
            FROM workflows
            WHERE name = $1 AND owner_id = $2
            ORDER BY run_number_major DESC, run_number_minor DESC
            LIMIT 1
            "#,
        )
        .bind(name)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(major, minor)| RunNumber::new(major, minor)))
    }

    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: &str,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
        stopped_at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE workflows
            SET status = $1,
                started_at = COALESCE($2, started_at),
                finished_at = COALESCE($3, finished_at),
                stopped_at = COALESCE($4, stopped_at)
            WHERE id = $5
            "#,
        )
        .bind(status)
        .bind(started_at)
        .bind(finished_at)
        .bind(stopped_at)
        .bind(workflow_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_workflow(&self, workflow_id: Uuid) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM jobs WHERE workflow_id = $1")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM quota_usage WHERE subject_kind = 'workflow' AND subject_id = $1")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn count_active_workflows(&self, owner_id: Uuid) -> Result<i64, CoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM workflows
            WHERE owner_id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn set_workspace_bytes(&self, workflow_id: Uuid, bytes: i64) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE workflows
            SET workspace_bytes = $1
            WHERE id = $2
            "#,
        )
        .bind(bytes)
        .bind(workflow_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_job(&self, job: &JobRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, workflow_id, status, backend_job_id,
                              created_at, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(job.id)
        .bind(job.workflow_id)
        .bind(&job.status)
        .bind(&job.backend_job_id)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, CoreError> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, workflow_id, status, backend_job_id,
                   created_at, started_at, finished_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: &str,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $1,
                started_at = COALESCE($2, started_at),
                finished_at = COALESCE($3, finished_at)
            WHERE id = $4
            "#,
        )
        .bind(status)
        .bind(started_at)
        .bind(finished_at)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_backend_job_id(
        &self,
        job_id: Uuid,
        backend_job_id: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET backend_job_id = $1
            WHERE id = $2 AND backend_job_id IS NULL
            "#,
        )
        .bind(backend_job_id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_usage(
        &self,
        subject: SubjectRef,
        resource: ResourceType,
    ) -> Result<u64, CoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT quota_used
            FROM quota_usage
            WHERE subject_kind = $1 AND subject_id = $2 AND resource_type = $3
            "#,
        )
        .bind(subject.kind.as_str())
        .bind(subject.id)
        .bind(resource.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(used,)| used.max(0) as u64).unwrap_or(0))
    }

    async fn increment_usage(
        &self,
        subject: SubjectRef,
        resource: ResourceType,
        delta: i64,
    ) -> Result<bool, CoreError> {
        // Row lock, then read-modify-write; the lock holds until commit so
        // racing increments for the same key apply one after another.
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO quota_usage (subject_kind, subject_id, resource_type, quota_used, updated_at)
            VALUES ($1, $2, $3, 0, NOW())
            ON CONFLICT (subject_kind, subject_id, resource_type) DO NOTHING
            "#,
        )
        .bind(subject.kind.as_str())
        .bind(subject.id)
        .bind(resource.as_str())
        .execute(&mut *tx)
        .await?;

        let (current,): (i64,) = sqlx::query_as(
            r#"
            SELECT quota_used
            FROM quota_usage
            WHERE subject_kind = $1 AND subject_id = $2 AND resource_type = $3
            FOR UPDATE
            "#,
        )
        .bind(subject.kind.as_str())
        .bind(subject.id)
        .bind(resource.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let updated = current.saturating_add(delta);
        let clamped = updated < 0;

        sqlx::query(
            r#"
            UPDATE quota_usage
            SET quota_used = $1, updated_at = NOW()
            WHERE subject_kind = $2 AND subject_id = $3 AND resource_type = $4
            "#,
        )
        .bind(updated.max(0))
        .bind(subject.kind.as_str())
        .bind(subject.id)
        .bind(resource.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(clamped)
    }

    async fn set_usage(
        &self,
        subject: SubjectRef,
        resource: ResourceType,
        amount: u64,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO quota_usage (subject_kind, subject_id, resource_type, quota_used, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (subject_kind, subject_id, resource_type)
            DO UPDATE SET quota_used = EXCLUDED.quota_used, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(subject.kind.as_str())
        .bind(subject.id)
        .bind(resource.as_str())
        .bind(amount as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_quota_limit(
        &self,
        subject: SubjectRef,
        resource: ResourceType,
        limit: Option<u64>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO quota_usage (subject_kind, subject_id, resource_type, quota_used, quota_limit, updated_at)
            VALUES ($1, $2, $3, 0, $4, NOW())
            ON CONFLICT (subject_kind, subject_id, resource_type)
            DO UPDATE SET quota_limit = EXCLUDED.quota_limit, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(subject.kind.as_str())
        .bind(subject.id)
        .bind(resource.as_str())
        .bind(limit.map(|limit| limit as i64))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_quota_health(
        &self,
        subject: SubjectRef,
        resource: ResourceType,
        health: &str,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO quota_usage (subject_kind, subject_id, resource_type, quota_used, health, updated_at)
            VALUES ($1, $2, $3, 0, $4, NOW())
            ON CONFLICT (subject_kind, subject_id, resource_type)
            DO UPDATE SET health = EXCLUDED.health, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(subject.kind.as_str())
        .bind(subject.id)
        .bind(resource.as_str())
        .bind(health)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_quota_row(
        &self,
        subject: SubjectRef,
        resource: ResourceType,
    ) -> Result<Option<QuotaRow>, CoreError> {
        let record = sqlx::query_as::<_, QuotaRow>(
            r#"
            SELECT subject_kind, subject_id, resource_type,
                   quota_used, quota_limit, health, updated_at
            FROM quota_usage
            WHERE subject_kind = $1 AND subject_id = $2 AND resource_type = $3
            "#,
        )
        .bind(subject.kind.as_str())
        .bind(subject.id)
        .bind(resource.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_quota_rows(&self, subject: SubjectRef) -> Result<Vec<QuotaRow>, CoreError> {
        let rows = sqlx::query_as::<_, QuotaRow>(
            r#"
            SELECT subject_kind, subject_id, resource_type,
                   quota_used, quota_limit, health, updated_at
            FROM quota_usage
            WHERE subject_kind = $1 AND subject_id = $2
            ORDER BY resource_type
            "#,
        )
        .bind(subject.kind.as_str())
        .bind(subject.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn list_quota_subjects(
        &self,
        active_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SubjectRef>, CoreError> {
        let mut subjects = Vec::new();

        if let Some(since) = active_since {
            let users: Vec<(Uuid,)> = sqlx::query_as(
                r#"
                SELECT DISTINCT owner_id
                FROM workflows
                WHERE COALESCE(stopped_at, finished_at, started_at, created_at) >= $1
                "#,
            )
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
            for (id,) in users {
                subjects.push(SubjectRef::user(id));
            }

            let workflows: Vec<(Uuid,)> = sqlx::query_as(
                r#"
                SELECT id
                FROM workflows
                WHERE status != 'deleted'
                  AND COALESCE(stopped_at, finished_at, started_at, created_at) >= $1
                "#,
            )
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
            for (id,) in workflows {
                subjects.push(SubjectRef::workflow(id));
            }
        } else {
            let users: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM users ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
            for (id,) in users {
                subjects.push(SubjectRef::user(id));
            }

            let workflows: Vec<(Uuid,)> = sqlx::query_as(
                "SELECT id FROM workflows WHERE status != 'deleted' ORDER BY created_at",
            )
            .fetch_all(&self.pool)
            .await?;
            for (id,) in workflows {
                subjects.push(SubjectRef::workflow(id));
            }
        }

        Ok(subjects)
    }

    async fn sampled_cpu_seconds(&self, subject: SubjectRef) -> Result<i64, CoreError> {
        let rows: Vec<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> = match subject.kind {
            SubjectKind::Workflow => {
                sqlx::query_as(
                    r#"
                    SELECT started_at, finished_at
                    FROM jobs
                    WHERE workflow_id = $1
                      AND status IN ('finished', 'failed', 'stopped')
                    "#,
                )
                .bind(subject.id)
                .fetch_all(&self.pool)
                .await?
            }
            SubjectKind::User => {
                sqlx::query_as(
                    r#"
                    SELECT j.started_at, j.finished_at
                    FROM jobs j
                    JOIN workflows w ON j.workflow_id = w.id
                    WHERE w.owner_id = $1
                      AND j.status IN ('finished', 'failed', 'stopped')
                    "#,
                )
                .bind(subject.id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(sum_cpu_seconds(&rows))
    }

    async fn sampled_workspace_bytes(&self, subject: SubjectRef) -> Result<i64, CoreError> {
        match subject.kind {
            SubjectKind::Workflow => {
                let row: Option<(i64,)> =
                    sqlx::query_as("SELECT workspace_bytes FROM workflows WHERE id = $1")
                        .bind(subject.id)
                        .fetch_optional(&self.pool)
                        .await?;
                row.map(|(bytes,)| bytes).ok_or(CoreError::WorkflowNotFound {
                    workflow_id: subject.id.to_string(),
                })
            }
            SubjectKind::User => {
                let row: (i64,) = sqlx::query_as(
                    r#"
                    SELECT COALESCE(SUM(workspace_bytes), 0)::BIGINT
                    FROM workflows
                    WHERE owner_id = $1 AND status != 'deleted'
                    "#,
                )
                .bind(subject.id)
                .fetch_one(&self.pool)
                .await?;
                Ok(row.0)
            }
        }
    }

    async fn insert_audit_log(
        &self,
        actor_id: Uuid,
        action: &str,
        details: Option<&serde_json::Value>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (actor_id, action, details, created_at)
            VALUES ($1, $2, $3::jsonb, NOW())
            "#,
        )
        .bind(actor_id)
        .bind(action)
        .bind(details.map(|details| details.to_string()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_audit_logs(&self, actor_id: Uuid) -> Result<Vec<AuditLogRecord>, CoreError> {
        let rows = sqlx::query_as::<_, AuditLogRecord>(
            r#"
            SELECT id, actor_id, action, details::text AS details, created_at
            FROM audit_log
            WHERE actor_id = $1
            ORDER BY id DESC
            "#,
        )
        .bind(actor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
