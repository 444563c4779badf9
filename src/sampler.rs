// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Usage sampling for quota reconciliation.
//!
//! A sampler answers "how much of this resource is the subject truly
//! using right now". The reconciliation pass overwrites ledger entries
//! with sampled values, so drift accumulated by hot-path increments is
//! bounded by one pass interval.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::CoreError;
use crate::model::{ResourceType, SubjectRef, UsageRecord};
use crate::persistence::Persistence;

/// Source of authoritative usage measurements.
///
/// Implementations must be side-effect free; a sample that fails for one
/// subject is reported per subject and must not poison other subjects.
#[async_trait]
pub trait UsageSampler: Send + Sync {
    /// Measure a subject's current usage of a resource.
    async fn sample(
        &self,
        subject: SubjectRef,
        resource: ResourceType,
    ) -> Result<UsageRecord, CoreError>;
}

/// Sampler that derives usage from records already in the store.
///
/// CPU is the summed wall-clock runtime of terminal jobs; disk is the
/// workspace byte count recorded by the workspace service.
pub struct StoreSampler {
    persistence: Arc<dyn Persistence>,
}

impl StoreSampler {
    /// Create a sampler over the given store.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }
}

#[async_trait]
impl UsageSampler for StoreSampler {
    async fn sample(
        &self,
        subject: SubjectRef,
        resource: ResourceType,
    ) -> Result<UsageRecord, CoreError> {
        let amount = match resource {
            ResourceType::Cpu => self.persistence.sampled_cpu_seconds(subject).await?,
            ResourceType::Disk => self.persistence.sampled_workspace_bytes(subject).await?,
        };

        Ok(UsageRecord {
            subject,
            resource,
            amount: amount.max(0) as u64,
            measured_at: Utc::now(),
        })
    }
}
