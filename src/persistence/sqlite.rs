// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! Used for embedded deployments and the test suite. SQLite serializes
//! writers through its database-level lock, which satisfies the ledger's
//! per-key serialization contract.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{ResourceType, SubjectKind, SubjectRef};
use crate::run_number::RunNumber;

use super::{AuditLogRecord, JobRecord, Persistence, QuotaRow, UserRecord, WorkflowRecord};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The caller is responsible for running migrations
    /// (see [`crate::migrations::run_sqlite`]).
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Connects to the database with sensible defaults
    /// - Runs all migrations
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let path_str = path.to_string_lossy();
        let url = format!("sqlite:{}?mode=rwc", path_str);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn create_user(&self, user: &UserRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, full_name, max_concurrent_workflows, created_at)
            VALUES (?, ?, ?, ?, ?)
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
            WHERE id = ?
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
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
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
            WHERE id = ?
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
            WHERE name = ? AND owner_id = ?
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
            SET status = ?1,
                started_at = COALESCE(?2, started_at),
                finished_at = COALESCE(?3, finished_at),
                stopped_at = COALESCE(?4, stopped_at)
            WHERE id = ?5
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

        sqlx::query("DELETE FROM jobs WHERE workflow_id = ?")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM quota_usage WHERE subject_kind = 'workflow' AND subject_id = ?")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM workflows WHERE id = ?")
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
            WHERE owner_id = ? AND status IN ('pending', 'running')
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
            SET workspace_bytes = ?1
            WHERE id = ?2
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
            VALUES (?, ?, ?, ?, ?, ?, ?)
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
            WHERE id = ?
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
            SET status = ?1,
                started_at = COALESCE(?2, started_at),
                finished_at = COALESCE(?3, finished_at)
            WHERE id = ?4
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
            SET backend_job_id = ?1
            WHERE id = ?2 AND backend_job_id IS NULL
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
            WHERE subject_kind = ? AND subject_id = ? AND resource_type = ?
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
        // Read-modify-write inside one transaction; SQLite's write lock
        // serializes concurrent increments for the same key.
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO quota_usage (subject_kind, subject_id, resource_type, quota_used, updated_at)
            VALUES (?, ?, ?, 0, ?)
            ON CONFLICT (subject_kind, subject_id, resource_type) DO NOTHING
            "#,
        )
        .bind(subject.kind.as_str())
        .bind(subject.id)
        .bind(resource.as_str())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        let (current,): (i64,) = sqlx::query_as(
            r#"
            SELECT quota_used
            FROM quota_usage
            WHERE subject_kind = ? AND subject_id = ? AND resource_type = ?
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
            SET quota_used = ?1, updated_at = ?2
            WHERE subject_kind = ?3 AND subject_id = ?4 AND resource_type = ?5
            "#,
        )
        .bind(updated.max(0))
        .bind(Utc::now())
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
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (subject_kind, subject_id, resource_type)
            DO UPDATE SET quota_used = excluded.quota_used, updated_at = excluded.updated_at
            "#,
        )
        .bind(subject.kind.as_str())
        .bind(subject.id)
        .bind(resource.as_str())
        .bind(amount as i64)
        .bind(Utc::now())
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
            VALUES (?1, ?2, ?3, 0, ?4, ?5)
            ON CONFLICT (subject_kind, subject_id, resource_type)
            DO UPDATE SET quota_limit = excluded.quota_limit, updated_at = excluded.updated_at
            "#,
        )
        .bind(subject.kind.as_str())
        .bind(subject.id)
        .bind(resource.as_str())
        .bind(limit.map(|limit| limit as i64))
        .bind(Utc::now())
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
            VALUES (?1, ?2, ?3, 0, ?4, ?5)
            ON CONFLICT (subject_kind, subject_id, resource_type)
            DO UPDATE SET health = excluded.health, updated_at = excluded.updated_at
            "#,
        )
        .bind(subject.kind.as_str())
        .bind(subject.id)
        .bind(resource.as_str())
        .bind(health)
        .bind(Utc::now())
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
            WHERE subject_kind = ? AND subject_id = ? AND resource_type = ?
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
            WHERE subject_kind = ? AND subject_id = ?
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
                WHERE COALESCE(stopped_at, finished_at, started_at, created_at) >= ?
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
                  AND COALESCE(stopped_at, finished_at, started_at, created_at) >= ?
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
                    WHERE workflow_id = ?
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
                    WHERE w.owner_id = ?
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
                    sqlx::query_as("SELECT workspace_bytes FROM workflows WHERE id = ?")
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
                    SELECT COALESCE(SUM(workspace_bytes), 0)
                    FROM workflows
                    WHERE owner_id = ? AND status != 'deleted'
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
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(actor_id)
        .bind(action)
        .bind(details.map(|details| details.to_string()))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_audit_logs(&self, actor_id: Uuid) -> Result<Vec<AuditLogRecord>, CoreError> {
        let rows = sqlx::query_as::<_, AuditLogRecord>(
            r#"
            SELECT id, actor_id, action, details, created_at
            FROM audit_log
            WHERE actor_id = ?
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

/// Sum wall-clock seconds over `(started_at, finished_at)` pairs, skipping
/// jobs that never started or never finished.
pub(crate) fn sum_cpu_seconds(rows: &[(Option<DateTime<Utc>>, Option<DateTime<Utc>>)]) -> i64 {
    rows.iter()
        .filter_map(|(started, finished)| match (started, finished) {
            (Some(started), Some(finished)) => Some((*finished - *started).num_seconds().max(0)),
            _ => None,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sum_cpu_seconds() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 5, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 6, 1, 13, 0, 0).unwrap();

        assert_eq!(sum_cpu_seconds(&[]), 0);
        assert_eq!(sum_cpu_seconds(&[(Some(t0), Some(t1))]), 300);
        assert_eq!(
            sum_cpu_seconds(&[(Some(t0), Some(t1)), (Some(t1), Some(t2))]),
            300 + 3300
        );
        // unstarted and unfinished jobs contribute nothing
        assert_eq!(sum_cpu_seconds(&[(None, Some(t1)), (Some(t0), None)]), 0);
        // a clock skew that makes finished < started counts as zero
        assert_eq!(sum_cpu_seconds(&[(Some(t1), Some(t0))]), 0);
    }
}
