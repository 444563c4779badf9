// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Quota health classification.
//!
//! Health is derived from the used/limit ratio against configured
//! percentage bands; it is recomputed, never stored as source of truth.
//! Band edges changed across platform versions, so they are configuration
//! rather than constants.

use crate::model::{QuotaHealth, ResourceType};

/// Percentage band edges for quota health classification.
///
/// Usage below `warning_pct` is healthy, `[warning_pct, critical_pct)` is
/// a warning, `[critical_pct, exceeded_pct)` is critical, and anything at
/// or above `exceeded_pct` is exceeded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthBands {
    /// Lower edge of the warning band, as a percentage of the limit.
    pub warning_pct: f64,
    /// Lower edge of the critical band, as a percentage of the limit.
    pub critical_pct: f64,
    /// Lower edge of the exceeded band, as a percentage of the limit.
    pub exceeded_pct: f64,
}

impl Default for HealthBands {
    fn default() -> Self {
        Self {
            warning_pct: 50.0,
            critical_pct: 80.0,
            exceeded_pct: 100.0,
        }
    }
}

impl HealthBands {
    /// Validate that the band edges are ordered and positive.
    pub fn validate(&self) -> Result<(), String> {
        if self.warning_pct <= 0.0 {
            return Err("warning band edge must be positive".to_string());
        }
        if self.warning_pct >= self.critical_pct {
            return Err("warning band edge must be below the critical edge".to_string());
        }
        if self.critical_pct > self.exceeded_pct {
            return Err("critical band edge must not exceed the exceeded edge".to_string());
        }
        Ok(())
    }

    /// Classify usage against a limit.
    ///
    /// A missing or zero limit means the subject is unlimited and always
    /// healthy.
    pub fn classify(&self, used: u64, limit: Option<u64>) -> QuotaHealth {
        let limit = match limit {
            Some(limit) if limit > 0 => limit,
            _ => return QuotaHealth::Healthy,
        };
        let percentage = used as f64 / limit as f64 * 100.0;
        if percentage >= self.exceeded_pct {
            QuotaHealth::Exceeded
        } else if percentage >= self.critical_pct {
            QuotaHealth::Critical
        } else if percentage >= self.warning_pct {
            QuotaHealth::Warning
        } else {
            QuotaHealth::Healthy
        }
    }
}

/// A derived view of one quota, produced for callers and operators.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaReport {
    /// The resource the quota covers.
    pub resource: ResourceType,
    /// Raw usage in the resource's canonical unit.
    pub used: u64,
    /// Configured limit, if any; `None` means unlimited.
    pub limit: Option<u64>,
    /// Health classification of used against limit.
    pub health: QuotaHealth,
    /// Usage rendered in human-readable units.
    pub used_human_readable: String,
}

impl QuotaReport {
    /// Build a report for one quota row.
    pub fn new(resource: ResourceType, used: u64, limit: Option<u64>, bands: &HealthBands) -> Self {
        Self {
            resource,
            used,
            limit,
            health: bands.classify(used, limit),
            used_human_readable: resource.unit().human_readable(used),
        }
    }

    /// Whether admission logic must deny new work for this subject.
    pub fn is_exceeded(&self) -> bool {
        self.health == QuotaHealth::Exceeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bands() {
        let bands = HealthBands::default();
        assert_eq!(bands.classify(0, Some(100)), QuotaHealth::Healthy);
        assert_eq!(bands.classify(49, Some(100)), QuotaHealth::Healthy);
        assert_eq!(bands.classify(50, Some(100)), QuotaHealth::Warning);
        assert_eq!(bands.classify(79, Some(100)), QuotaHealth::Warning);
        assert_eq!(bands.classify(80, Some(100)), QuotaHealth::Critical);
        assert_eq!(bands.classify(99, Some(100)), QuotaHealth::Critical);
        assert_eq!(bands.classify(100, Some(100)), QuotaHealth::Exceeded);
        assert_eq!(bands.classify(250, Some(100)), QuotaHealth::Exceeded);
    }

    #[test]
    fn test_unlimited_subjects_are_healthy() {
        let bands = HealthBands::default();
        assert_eq!(bands.classify(u64::MAX, None), QuotaHealth::Healthy);
        assert_eq!(bands.classify(u64::MAX, Some(0)), QuotaHealth::Healthy);
    }

    #[test]
    fn test_custom_band_edges() {
        let bands = HealthBands {
            warning_pct: 60.0,
            critical_pct: 85.0,
            exceeded_pct: 100.0,
        };
        assert_eq!(bands.classify(59, Some(100)), QuotaHealth::Healthy);
        assert_eq!(bands.classify(60, Some(100)), QuotaHealth::Warning);
        assert_eq!(bands.classify(85, Some(100)), QuotaHealth::Critical);
    }

    #[test]
    fn test_band_validation() {
        assert!(HealthBands::default().validate().is_ok());
        assert!(
            HealthBands {
                warning_pct: 80.0,
                critical_pct: 50.0,
                exceeded_pct: 100.0,
            }
            .validate()
            .is_err()
        );
        assert!(
            HealthBands {
                warning_pct: 0.0,
                critical_pct: 50.0,
                exceeded_pct: 100.0,
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn test_quota_report() {
        let bands = HealthBands::default();
        let report = QuotaReport::new(ResourceType::Disk, 512, Some(1024), &bands);
        assert_eq!(report.health, QuotaHealth::Warning);
        assert_eq!(report.used_human_readable, "512 Bytes");
        assert!(!report.is_exceeded());

        let report = QuotaReport::new(ResourceType::Cpu, 7200, Some(3600), &bands);
        assert!(report.is_exceeded());
        assert_eq!(report.used_human_readable, "2h");
    }
}
