// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduling priority for workflow runs.
//!
//! Priority combines two independent inputs: the workflow's precomputed
//! complexity scalar and how loaded the owning user already is relative to
//! their concurrency allowance. The returned integer is consumed by the
//! external scheduler with the convention **higher sorts first**.
//!
//! Every factor is floored at a small positive value, so the result is
//! always a finite, comparable integer: a user with a zero concurrency
//! allowance still gets a low-but-schedulable priority rather than a
//! sentinel the scheduler would never dequeue.

/// Tunable parameters for the priority formula.
///
/// The exact weighting is configuration, not business logic; only the
/// monotonicity and zero-allowance-safety properties are contractual.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityWeights {
    /// Upper bound of the returned priority range.
    pub max_priority: i32,
    /// Floor applied to both factors; must be in `(0, 1]`.
    pub load_floor: f64,
    /// Fraction of the allowance that degrades priority before the floor
    /// kicks in. Below 1.0 so a user at exactly their allowance keeps a
    /// positive factor and complexity still differentiates requeued runs.
    pub load_headroom: f64,
    /// Complexity scalar treated as the capacity reference; runs at or
    /// above it share the lowest complexity factor.
    pub capacity: i64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            max_priority: 100,
            load_floor: 0.1,
            load_headroom: 0.9,
            capacity: 1_000_000,
        }
    }
}

impl PriorityWeights {
    /// Validate that the weights are usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_priority < 1 {
            return Err("max priority must be at least 1".to_string());
        }
        if !(self.load_floor > 0.0 && self.load_floor <= 1.0) {
            return Err("load floor must be in (0, 1]".to_string());
        }
        if !(self.load_headroom > 0.0 && self.load_headroom < 1.0) {
            return Err("load headroom must be in (0, 1)".to_string());
        }
        if self.capacity < 1 {
            return Err("capacity must be positive".to_string());
        }
        Ok(())
    }

    /// Factor in `[load_floor, 1]` reflecting how loaded the user is.
    ///
    /// Decreases as `running_count` approaches the allowance. An allowance
    /// of zero means the user has no concurrency budget of their own; the
    /// floor keeps their runs schedulable instead of starving them.
    fn load_factor(&self, running_count: u32, allowance: u32) -> f64 {
        if allowance == 0 || running_count > allowance {
            return self.load_floor;
        }
        let factor = 1.0 - (running_count as f64 * self.load_headroom) / allowance as f64;
        factor.max(self.load_floor)
    }

    /// Factor in `[load_floor, 1]` favouring lower-complexity runs.
    ///
    /// Higher complexity lowers the factor but never zeroes it, so heavy
    /// runs are deprioritised rather than starved.
    fn complexity_factor(&self, complexity: i64) -> f64 {
        let complexity = complexity.max(0);
        if complexity >= self.capacity {
            return self.load_floor;
        }
        let factor = 1.0 - complexity as f64 / self.capacity as f64;
        factor.max(self.load_floor)
    }

    /// Compute the scheduling priority for a run.
    ///
    /// * `complexity`: the run's complexity scalar
    ///   (see [`crate::model::complexity_scalar`]).
    /// * `running_count`: the owner's workflows currently pending or
    ///   running.
    /// * `allowance`: the owner's concurrency allowance.
    ///
    /// Monotonic: the result never increases when complexity or load
    /// increases, and is always in `[1, max_priority]`.
    pub fn priority(&self, complexity: i64, running_count: u32, allowance: u32) -> i32 {
        let combined = self.load_factor(running_count, allowance) * self.complexity_factor(complexity);
        let scaled = (combined * self.max_priority as f64).round() as i32;
        scaled.clamp(1, self.max_priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_user_small_run_gets_top_priority() {
        let weights = PriorityWeights::default();
        assert_eq!(weights.priority(0, 0, 4), weights.max_priority);
    }

    #[test]
    fn test_zero_allowance_is_finite_and_sortable() {
        let weights = PriorityWeights::default();
        let priority = weights.priority(10_000, 0, 0);
        assert!(priority >= 1);
        assert!(priority <= weights.max_priority);
        // still ordered below an unloaded user with the same run
        assert!(priority < weights.priority(10_000, 0, 4));
    }

    #[test]
    fn test_monotonic_in_complexity() {
        let weights = PriorityWeights::default();
        let mut previous = i32::MAX;
        for complexity in [0, 1_000, 100_000, 500_000, 999_999, 2_000_000] {
            let priority = weights.priority(complexity, 1, 4);
            assert!(priority <= previous, "complexity {} raised priority", complexity);
            previous = priority;
        }
    }

    #[test]
    fn test_monotonic_in_load() {
        let weights = PriorityWeights::default();
        let mut previous = i32::MAX;
        for running in 0..=6 {
            let priority = weights.priority(1_000, running, 4);
            assert!(priority <= previous, "load {} raised priority", running);
            previous = priority;
        }
    }

    #[test]
    fn test_heavy_run_is_deprioritised_not_starved() {
        let weights = PriorityWeights::default();
        // complexity above capacity still yields a schedulable value
        let priority = weights.priority(weights.capacity * 10, 0, 4);
        assert!(priority >= 1);
        assert!(priority < weights.priority(0, 0, 4));
    }

    #[test]
    fn test_user_at_allowance_keeps_complexity_differentiation() {
        let weights = PriorityWeights::default();
        // headroom below 1.0 keeps the load factor positive at the cap, so
        // a lighter run still sorts ahead of a heavier one when requeued
        let light = weights.priority(1_000, 4, 4);
        let heavy = weights.priority(900_000, 4, 4);
        assert!(light >= heavy);
        assert!(heavy >= 1);
    }

    #[test]
    fn test_weight_validation() {
        assert!(PriorityWeights::default().validate().is_ok());
        assert!(
            PriorityWeights {
                load_floor: 0.0,
                ..PriorityWeights::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            PriorityWeights {
                load_headroom: 1.0,
                ..PriorityWeights::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            PriorityWeights {
                max_priority: 0,
                ..PriorityWeights::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            PriorityWeights {
                capacity: 0,
                ..PriorityWeights::default()
            }
            .validate()
            .is_err()
        );
    }
}
