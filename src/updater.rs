// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic quota reconciliation.
//!
//! The updater walks quota subjects, overwrites their ledger entries with
//! freshly sampled values and recomputes health classifications. Running
//! it twice in a row without intervening activity is a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::error::CoreError;
use crate::model::{ResourceType, SubjectRef};
use crate::persistence::Persistence;
use crate::quota::HealthBands;
use crate::sampler::UsageSampler;

/// Subject selection policy for reconciliation passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Reconcile every user and every non-deleted workflow.
    All,
    /// Reconcile only subjects with lifecycle activity since the previous
    /// pass. Falls back to a full pass when no previous pass is recorded.
    ActiveSinceLastPass,
}

/// Outcome summary of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct PassReport {
    /// Subjects selected by the policy.
    pub subjects_total: usize,
    /// Ledger entries successfully reconciled.
    pub processed: usize,
    /// Per-subject failures that were skipped over.
    pub failed: usize,
    /// Wall-clock duration of the pass.
    pub elapsed: Duration,
}

impl PassReport {
    /// Whether every selected subject reconciled cleanly.
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Walks quota subjects and reconciles their ledger entries.
pub struct QuotaUpdater {
    persistence: Arc<dyn Persistence>,
    sampler: Arc<dyn UsageSampler>,
    bands: HealthBands,
    policy: UpdatePolicy,
    last_pass: Option<DateTime<Utc>>,
}

impl QuotaUpdater {
    /// Create a new updater.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        sampler: Arc<dyn UsageSampler>,
        bands: HealthBands,
        policy: UpdatePolicy,
    ) -> Self {
        Self {
            persistence,
            sampler,
            bands,
            policy,
            last_pass: None,
        }
    }

    /// Run one reconciliation pass over the given resources.
    ///
    /// `force` ignores the policy's activity filter and reconciles every
    /// subject. A failure scoped to one subject is logged, counted and
    /// skipped; a systemic store failure aborts the pass with an error so
    /// a half-reconciled ledger is not reported as a finished pass.
    #[instrument(skip(self), fields(policy = ?self.policy))]
    pub async fn run_pass(
        &mut self,
        resources: &[ResourceType],
        force: bool,
    ) -> Result<PassReport, CoreError> {
        let pass_started = Utc::now();
        let timer = std::time::Instant::now();

        let active_since = match self.policy {
            UpdatePolicy::All => None,
            UpdatePolicy::ActiveSinceLastPass if force => None,
            UpdatePolicy::ActiveSinceLastPass => self.last_pass,
        };

        let subjects = self.persistence.list_quota_subjects(active_since).await?;
        info!(
            subjects = subjects.len(),
            resources = ?resources,
            "Starting quota reconciliation pass"
        );

        let mut processed = 0usize;
        let mut failed = 0usize;

        for (index, subject) in subjects.iter().enumerate() {
            for resource in resources {
                match self.reconcile_one(*subject, *resource).await {
                    Ok(()) => processed += 1,
                    Err(err) if err.is_systemic() => {
                        error!(
                            subject = %subject,
                            resource = resource.as_str(),
                            error = %err,
                            "Store unavailable, aborting reconciliation pass"
                        );
                        return Err(err);
                    }
                    Err(err) => {
                        warn!(
                            subject = %subject,
                            resource = resource.as_str(),
                            error = %err,
                            "Skipping subject after reconciliation failure"
                        );
                        failed += 1;
                    }
                }
            }

            if (index + 1) % 100 == 0 {
                info!(
                    done = index + 1,
                    total = subjects.len(),
                    "Reconciliation pass progress"
                );
            }
        }

        self.last_pass = Some(pass_started);

        let report = PassReport {
            subjects_total: subjects.len(),
            processed,
            failed,
            elapsed: timer.elapsed(),
        };
        info!(
            subjects = report.subjects_total,
            processed = report.processed,
            failed = report.failed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Quota reconciliation pass complete"
        );
        Ok(report)
    }

    /// Reconcile one ledger entry: sample, overwrite, reclassify.
    async fn reconcile_one(
        &self,
        subject: SubjectRef,
        resource: ResourceType,
    ) -> Result<(), CoreError> {
        let measured = self.sampler.sample(subject, resource).await?;
        self.persistence
            .set_usage(subject, resource, measured.amount)
            .await?;

        let limit = self
            .persistence
            .get_quota_row(subject, resource)
            .await?
            .and_then(|row| row.limit());
        let health = self.bands.classify(measured.amount, limit);
        self.persistence
            .set_quota_health(subject, resource, health.as_str())
            .await?;

        debug!(
            subject = %subject,
            resource = resource.as_str(),
            used = measured.amount,
            health = health.as_str(),
            "Reconciled ledger entry"
        );
        Ok(())
    }

    /// Run reconciliation passes on a fixed interval until shutdown.
    ///
    /// A pass aborted by a store failure is logged and retried on the next
    /// tick; the loop only exits on the shutdown signal.
    pub async fn run_periodic(
        &mut self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
        resources: &[ResourceType],
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(interval_secs = interval.as_secs(), "Quota updater started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Quota updater shutting down");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if let Err(err) = self.run_pass(resources, false).await {
                        error!(error = %err, "Reconciliation pass failed, will retry next tick");
                    }
                }
            }
        }
    }
}
