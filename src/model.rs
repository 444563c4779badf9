// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared data model for the accounting core.
//!
//! Defines the resource and subject vocabulary used by the quota ledger,
//! the usage sampler, and the updater. Database record types live in
//! [`crate::persistence`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A resource type tracked by the quota ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// Processor time, measured in CPU-seconds.
    Cpu,
    /// Workspace storage, measured in bytes.
    Disk,
}

impl ResourceType {
    /// All tracked resource types.
    pub const ALL: [ResourceType; 2] = [ResourceType::Cpu, ResourceType::Disk];

    /// Stable lowercase name used in storage columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Cpu => "cpu",
            ResourceType::Disk => "disk",
        }
    }

    /// Parse a storage column value back into a resource type.
    pub fn parse(s: &str) -> Option<ResourceType> {
        match s {
            "cpu" => Some(ResourceType::Cpu),
            "disk" => Some(ResourceType::Disk),
            _ => None,
        }
    }

    /// Canonical unit in which this resource is measured.
    pub fn unit(&self) -> ResourceUnit {
        match self {
            ResourceType::Cpu => ResourceUnit::CpuSeconds,
            ResourceType::Disk => ResourceUnit::Bytes,
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical measurement unit of a resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceUnit {
    /// Bytes of storage.
    Bytes,
    /// Seconds of processor time.
    CpuSeconds,
}

impl ResourceUnit {
    /// Render a raw amount in this unit as a human-readable string.
    ///
    /// Bytes use binary prefixes (`512 Bytes`, `1.5 MiB`); CPU seconds use
    /// `h`/`m`/`s` components (`1h 2m 3s`).
    pub fn human_readable(&self, amount: u64) -> String {
        match self {
            ResourceUnit::Bytes => human_readable_bytes(amount),
            ResourceUnit::CpuSeconds => human_readable_seconds(amount),
        }
    }
}

fn human_readable_bytes(bytes: u64) -> String {
    const UNITS: [&str; 9] = [
        "Bytes", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB", "ZiB", "YiB",
    ];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let exponent = (bytes.ilog2() / 10).min(UNITS.len() as u32 - 1);
    let converted = bytes as f64 / f64::powi(1024.0, exponent as i32);
    let rounded = (converted * 100.0).round() / 100.0;
    if rounded.fract() == 0.0 {
        format!("{} {}", rounded as u64, UNITS[exponent as usize])
    } else {
        format!("{} {}", rounded, UNITS[exponent as usize])
    }
}

fn human_readable_seconds(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds / 60) % 60;
    let secs = seconds % 60;

    let mut out = String::new();
    for (value, unit) in [(hours, "h"), (minutes, "m"), (secs, "s")] {
        if value >= 1 {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&format!("{}{}", value, unit));
        }
    }
    if out.is_empty() { "0s".to_string() } else { out }
}

/// Health classification of a quota, derived from used/limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaHealth {
    /// Usage comfortably below the limit.
    Healthy,
    /// Usage approaching the limit.
    Warning,
    /// Usage close to the limit.
    Critical,
    /// Usage at or over the limit; admission logic must deny new work.
    Exceeded,
}

impl QuotaHealth {
    /// Stable lowercase name used in storage columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaHealth::Healthy => "healthy",
            QuotaHealth::Warning => "warning",
            QuotaHealth::Critical => "critical",
            QuotaHealth::Exceeded => "exceeded",
        }
    }

    /// Parse a storage column value back into a health status.
    pub fn parse(s: &str) -> Option<QuotaHealth> {
        match s {
            "healthy" => Some(QuotaHealth::Healthy),
            "warning" => Some(QuotaHealth::Warning),
            "critical" => Some(QuotaHealth::Critical),
            "exceeded" => Some(QuotaHealth::Exceeded),
            _ => None,
        }
    }
}

impl std::fmt::Display for QuotaHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of entity quota is accounted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectKind {
    /// A platform user; aggregates usage across their workflows.
    User,
    /// A single workflow run.
    Workflow,
}

impl SubjectKind {
    /// Stable lowercase name used in storage columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::User => "user",
            SubjectKind::Workflow => "workflow",
        }
    }
}

/// A quota accounting subject: a user or a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubjectRef {
    /// Whether the subject is a user or a workflow.
    pub kind: SubjectKind,
    /// The subject's unique identifier.
    pub id: Uuid,
}

impl SubjectRef {
    /// Reference a user subject.
    pub fn user(id: Uuid) -> Self {
        Self {
            kind: SubjectKind::User,
            id,
        }
    }

    /// Reference a workflow subject.
    pub fn workflow(id: Uuid) -> Self {
        Self {
            kind: SubjectKind::Workflow,
            id,
        }
    }
}

impl std::fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind.as_str(), self.id)
    }
}

/// An immutable usage snapshot produced by the usage sampler.
///
/// Never mutated; a newer snapshot supersedes an older one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageRecord {
    /// The subject the usage was measured for.
    pub subject: SubjectRef,
    /// The resource that was measured.
    pub resource: ResourceType,
    /// Raw amount in the resource's canonical unit.
    pub amount: u64,
    /// When the measurement was taken.
    pub measured_at: DateTime<Utc>,
}

/// Kinds of administrative actions recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLogAction {
    /// An administrator changed a subject's quota limit.
    QuotaOverride,
    /// A status transition was applied outside the normal lifecycle.
    StatusOverride,
}

impl AuditLogAction {
    /// Stable snake_case name used in storage columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditLogAction::QuotaOverride => "quota_override",
            AuditLogAction::StatusOverride => "status_override",
        }
    }
}

/// Sum a workflow's complexity pairs into a single scalar.
///
/// Each pair is (job multiplicity, resource weight); the scalar estimates
/// the run's total resource demand and feeds the priority calculator.
pub fn complexity_scalar(pairs: &[(i64, i64)]) -> i64 {
    pairs
        .iter()
        .fold(0i64, |sum, (multiplicity, weight)| {
            sum.saturating_add(multiplicity.saturating_mul(*weight))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_type_round_trip() {
        for resource in ResourceType::ALL {
            assert_eq!(ResourceType::parse(resource.as_str()), Some(resource));
        }
        assert_eq!(ResourceType::parse("memory"), None);
    }

    #[test]
    fn test_resource_units() {
        assert_eq!(ResourceType::Cpu.unit(), ResourceUnit::CpuSeconds);
        assert_eq!(ResourceType::Disk.unit(), ResourceUnit::Bytes);
    }

    #[test]
    fn test_human_readable_bytes() {
        assert_eq!(ResourceUnit::Bytes.human_readable(0), "0 Bytes");
        assert_eq!(ResourceUnit::Bytes.human_readable(512), "512 Bytes");
        assert_eq!(ResourceUnit::Bytes.human_readable(1024), "1 KiB");
        assert_eq!(ResourceUnit::Bytes.human_readable(1536), "1.5 KiB");
        assert_eq!(ResourceUnit::Bytes.human_readable(1024 * 1024), "1 MiB");
        assert_eq!(
            ResourceUnit::Bytes.human_readable(5 * 1024 * 1024 * 1024),
            "5 GiB"
        );
    }

    #[test]
    fn test_human_readable_seconds() {
        assert_eq!(ResourceUnit::CpuSeconds.human_readable(0), "0s");
        assert_eq!(ResourceUnit::CpuSeconds.human_readable(42), "42s");
        assert_eq!(ResourceUnit::CpuSeconds.human_readable(60), "1m");
        assert_eq!(ResourceUnit::CpuSeconds.human_readable(3723), "1h 2m 3s");
        assert_eq!(ResourceUnit::CpuSeconds.human_readable(7200), "2h");
    }

    #[test]
    fn test_quota_health_round_trip() {
        for health in [
            QuotaHealth::Healthy,
            QuotaHealth::Warning,
            QuotaHealth::Critical,
            QuotaHealth::Exceeded,
        ] {
            assert_eq!(QuotaHealth::parse(health.as_str()), Some(health));
        }
        assert_eq!(QuotaHealth::parse("unknown"), None);
    }

    #[test]
    fn test_subject_ref_display() {
        let id = Uuid::new_v4();
        assert_eq!(SubjectRef::user(id).to_string(), format!("user/{}", id));
        assert_eq!(
            SubjectRef::workflow(id).to_string(),
            format!("workflow/{}", id)
        );
    }

    #[test]
    fn test_complexity_scalar() {
        assert_eq!(complexity_scalar(&[]), 0);
        assert_eq!(complexity_scalar(&[(1, 10)]), 10);
        assert_eq!(complexity_scalar(&[(2, 10), (3, 5)]), 35);
        // saturates instead of overflowing
        assert_eq!(
            complexity_scalar(&[(i64::MAX, 2), (1, 1)]),
            i64::MAX
        );
    }
}
