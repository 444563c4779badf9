// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for flowtide-db integration tests.
//!
//! Provides TestContext over an in-memory SQLite database.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use flowtide_db::config::Config;
use flowtide_db::lifecycle::Lifecycle;
use flowtide_db::migrations;
use flowtide_db::model::ResourceType;
use flowtide_db::persistence::{Persistence, SqlitePersistence, UserRecord, WorkflowRecord};
use flowtide_db::priority::PriorityWeights;
use flowtide_db::quota::HealthBands;
use flowtide_db::updater::UpdatePolicy;

/// Test context that manages an in-memory database and the lifecycle
/// layer wired over it.
pub struct TestContext {
    pub pool: SqlitePool,
    pub persistence: Arc<dyn Persistence>,
    pub lifecycle: Lifecycle,
    pub config: Config,
}

impl TestContext {
    /// Create a new test context over a fresh in-memory SQLite database.
    ///
    /// A single pooled connection keeps every handle on the same
    /// in-memory database and serializes writes.
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    /// Create a test context with custom configuration.
    pub async fn with_config(config: Config) -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to open in-memory SQLite");

        migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");

        let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::new(pool.clone()));
        let lifecycle = Lifecycle::new(persistence.clone(), &config);

        Self {
            pool,
            persistence,
            lifecycle,
            config,
        }
    }

    /// Create a user with a unique email.
    pub async fn create_user(&self) -> UserRecord {
        self.lifecycle
            .create_user(
                &format!("{}@example.org", Uuid::new_v4()),
                Some("Test User".to_string()),
                None,
            )
            .await
            .expect("Failed to create user")
    }

    /// Create a workflow run in `created` status for the given owner.
    pub async fn create_workflow(&self, name: &str, owner_id: Uuid) -> WorkflowRecord {
        self.lifecycle
            .create_workflow(name, owner_id, &[(2, 10), (1, 5)], None)
            .await
            .expect("Failed to create workflow")
    }

    /// Backdate a job's start so a later terminal transition yields a
    /// known wall-clock runtime.
    pub async fn backdate_job_start(&self, job_id: Uuid, seconds: i64) {
        let started: DateTime<Utc> = Utc::now() - chrono::Duration::seconds(seconds);
        sqlx::query("UPDATE jobs SET started_at = ? WHERE id = ?")
            .bind(started)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .expect("Failed to backdate job start");
    }

    /// Read a quota ledger value directly from the database.
    pub async fn quota_used(&self, subject_kind: &str, subject_id: Uuid, resource: &str) -> i64 {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT quota_used
            FROM quota_usage
            WHERE subject_kind = ? AND subject_id = ? AND resource_type = ?
            "#,
        )
        .bind(subject_kind)
        .bind(subject_id)
        .bind(resource)
        .fetch_optional(&self.pool)
        .await
        .expect("Failed to read quota row");
        row.map(|(used,)| used).unwrap_or(0)
    }

    /// Read a stored health classification directly from the database.
    pub async fn quota_health(
        &self,
        subject_kind: &str,
        subject_id: Uuid,
        resource: &str,
    ) -> Option<String> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT health
            FROM quota_usage
            WHERE subject_kind = ? AND subject_id = ? AND resource_type = ?
            "#,
        )
        .bind(subject_kind)
        .bind(subject_id)
        .bind(resource)
        .fetch_optional(&self.pool)
        .await
        .expect("Failed to read quota row");
        row.map(|(health,)| health)
    }

    /// Count audit log entries for a given action.
    pub async fn audit_count(&self, action: &str) -> i64 {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_log WHERE action = ?")
            .bind(action)
            .fetch_one(&self.pool)
            .await
            .expect("Failed to count audit entries");
        row.0
    }
}

/// Configuration used by the test suite; matches production defaults.
pub fn test_config() -> Config {
    Config {
        database_url: "sqlite::memory:".to_string(),
        pool_size: 1,
        update_interval: Duration::from_secs(600),
        update_resources: ResourceType::ALL.to_vec(),
        update_policy: UpdatePolicy::All,
        health_bands: HealthBands::default(),
        max_restarts_per_major: 9,
        priority_weights: PriorityWeights::default(),
        default_cpu_limit: 0,
        default_disk_limit: 0,
        default_concurrency_allowance: 4,
    }
}
