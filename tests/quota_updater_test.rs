// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the periodic quota reconciliation pass.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use common::TestContext;
use flowtide_db::error::CoreError;
use flowtide_db::model::{ResourceType, SubjectRef, UsageRecord};
use flowtide_db::persistence::Persistence;
use flowtide_db::quota::HealthBands;
use flowtide_db::sampler::{StoreSampler, UsageSampler};
use flowtide_db::status::WorkflowStatus;
use flowtide_db::updater::{QuotaUpdater, UpdatePolicy};

fn updater(ctx: &TestContext, sampler: Arc<dyn UsageSampler>, policy: UpdatePolicy) -> QuotaUpdater {
    QuotaUpdater::new(
        ctx.persistence.clone(),
        sampler,
        HealthBands::default(),
        policy,
    )
}

fn store_sampler(ctx: &TestContext) -> Arc<dyn UsageSampler> {
    Arc::new(StoreSampler::new(ctx.persistence.clone()))
}

#[tokio::test]
async fn test_pass_overwrites_stale_ledger_value() {
    let ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let workflow = ctx.create_workflow("fit-sample", user.id).await;

    // the sampler reports 500 bytes against a 0-byte ledger value
    ctx.persistence
        .set_workspace_bytes(workflow.id, 500)
        .await
        .unwrap();

    let mut updater = updater(&ctx, store_sampler(&ctx), UpdatePolicy::All);
    let report = updater
        .run_pass(&[ResourceType::Disk], false)
        .await
        .unwrap();

    assert!(report.is_clean());
    assert_eq!(ctx.quota_used("workflow", workflow.id, "disk").await, 500);
    assert_eq!(ctx.quota_used("user", user.id, "disk").await, 500);
}

#[tokio::test]
async fn test_pass_is_idempotent() {
    let ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let workflow = ctx.create_workflow("fit-sample", user.id).await;
    ctx.persistence
        .set_workspace_bytes(workflow.id, 1_024)
        .await
        .unwrap();

    let mut updater = updater(&ctx, store_sampler(&ctx), UpdatePolicy::All);
    updater.run_pass(&[ResourceType::Disk], false).await.unwrap();
    let first = ctx.quota_used("workflow", workflow.id, "disk").await;

    // rerunning without new activity changes nothing
    updater.run_pass(&[ResourceType::Disk], false).await.unwrap();
    let second = ctx.quota_used("workflow", workflow.id, "disk").await;

    assert_eq!(first, 1_024);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_pass_recomputes_health() {
    let ctx = TestContext::new().await;
    let admin = ctx.create_user().await;
    let user = ctx.create_user().await;
    let workflow = ctx.create_workflow("fit-sample", user.id).await;
    let subject = SubjectRef::workflow(workflow.id);

    ctx.lifecycle
        .override_quota_limit(admin.id, subject, ResourceType::Disk, Some(1_000))
        .await
        .unwrap();
    ctx.persistence
        .set_workspace_bytes(workflow.id, 900)
        .await
        .unwrap();

    let mut updater = updater(&ctx, store_sampler(&ctx), UpdatePolicy::All);
    updater.run_pass(&[ResourceType::Disk], false).await.unwrap();

    // 900 of 1000 sits in the critical band (80..100)
    assert_eq!(
        ctx.quota_health("workflow", workflow.id, "disk").await.as_deref(),
        Some("critical")
    );

    ctx.persistence
        .set_workspace_bytes(workflow.id, 1_100)
        .await
        .unwrap();
    updater.run_pass(&[ResourceType::Disk], false).await.unwrap();
    assert_eq!(
        ctx.quota_health("workflow", workflow.id, "disk").await.as_deref(),
        Some("exceeded")
    );
}

/// Sampler that fails for one subject and delegates everything else.
struct FaultySampler {
    inner: Arc<dyn UsageSampler>,
    failing_subject: SubjectRef,
    error: fn() -> CoreError,
}

#[async_trait]
impl UsageSampler for FaultySampler {
    async fn sample(
        &self,
        subject: SubjectRef,
        resource: ResourceType,
    ) -> Result<UsageRecord, CoreError> {
        if subject == self.failing_subject {
            return Err((self.error)());
        }
        self.inner.sample(subject, resource).await
    }
}

#[tokio::test]
async fn test_single_subject_failure_is_continuable() {
    let ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let broken = ctx.create_workflow("broken", user.id).await;
    let healthy = ctx.create_workflow("healthy", user.id).await;
    ctx.persistence
        .set_workspace_bytes(healthy.id, 256)
        .await
        .unwrap();

    let sampler = Arc::new(FaultySampler {
        inner: store_sampler(&ctx),
        failing_subject: SubjectRef::workflow(broken.id),
        error: || CoreError::WorkflowNotFound {
            workflow_id: "missing".to_string(),
        },
    });

    let mut updater = updater(&ctx, sampler, UpdatePolicy::All);
    let report = updater
        .run_pass(&[ResourceType::Disk], false)
        .await
        .expect("pass must survive a per-subject failure");

    assert_eq!(report.failed, 1);
    assert!(report.processed >= 2, "user and healthy workflow reconcile");
    assert_eq!(ctx.quota_used("workflow", healthy.id, "disk").await, 256);
}

#[tokio::test]
async fn test_systemic_failure_aborts_pass() {
    let ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let workflow = ctx.create_workflow("fit-sample", user.id).await;

    let sampler = Arc::new(FaultySampler {
        inner: store_sampler(&ctx),
        failing_subject: SubjectRef::user(user.id),
        error: || CoreError::StoreUnavailable {
            details: "connection refused".to_string(),
        },
    });

    let mut updater = updater(&ctx, sampler, UpdatePolicy::All);
    let err = updater
        .run_pass(&[ResourceType::Disk], false)
        .await
        .unwrap_err();
    assert!(err.is_systemic());

    // the pass stopped before reaching the workflow subject
    assert_eq!(ctx.quota_used("workflow", workflow.id, "disk").await, 0);
}

#[tokio::test]
async fn test_periodic_runner_reconciles_and_stops_on_shutdown() {
    let ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let workflow = ctx.create_workflow("fit-sample", user.id).await;
    ctx.persistence
        .set_workspace_bytes(workflow.id, 640)
        .await
        .unwrap();

    let mut updater = updater(&ctx, store_sampler(&ctx), UpdatePolicy::All);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        updater
            .run_periodic(Duration::from_millis(20), shutdown_rx, &[ResourceType::Disk])
            .await;
    });

    // the first tick fires immediately; wait for its pass to land
    let mut reconciled = false;
    for _ in 0..100 {
        if ctx.quota_used("workflow", workflow.id, "disk").await == 640 {
            reconciled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(reconciled, "periodic pass reconciles the ledger");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("runner must exit on the shutdown signal")
        .unwrap();
}

#[tokio::test]
async fn test_active_policy_skips_inactive_subjects() {
    let ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let stale = ctx.create_workflow("stale", user.id).await;
    ctx.persistence.set_workspace_bytes(stale.id, 100).await.unwrap();

    let mut updater = updater(&ctx, store_sampler(&ctx), UpdatePolicy::ActiveSinceLastPass);

    // first pass has no previous pass recorded and reconciles everything
    let report = updater.run_pass(&[ResourceType::Disk], false).await.unwrap();
    assert!(report.subjects_total >= 2);

    // nothing happened since, so the next pass selects no subjects
    let report = updater.run_pass(&[ResourceType::Disk], false).await.unwrap();
    assert_eq!(report.subjects_total, 0);

    // new activity brings the workflow and its owner back into scope
    let fresh = ctx.create_workflow("fresh", user.id).await;
    ctx.lifecycle
        .update_workflow_status(fresh.id, WorkflowStatus::Pending)
        .await
        .unwrap();
    let report = updater.run_pass(&[ResourceType::Disk], false).await.unwrap();
    assert!(report.subjects_total >= 2, "fresh workflow and owner selected");

    // force bypasses the activity filter entirely
    let report = updater.run_pass(&[ResourceType::Disk], true).await.unwrap();
    assert!(report.subjects_total >= 3);
}
