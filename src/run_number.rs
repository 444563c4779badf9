// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Two-level run numbering for workflow restarts.
//!
//! Each logical workflow (name + owner) numbers its runs `major.minor`.
//! Restarts increment the minor component up to a configured maximum per
//! major version; the next restart then rolls over to `(major + 1, 0)`.
//! The two-level counter removes the historical ceiling on total restarts
//! while keeping the single-digit `major.minor` display format intact.

use serde::{Deserialize, Serialize};

/// Default maximum restarts per major version.
///
/// Nine keeps the minor component a single digit in rendered run names.
pub const DEFAULT_MAX_MINOR: u32 = 9;

/// A `(major, minor)` run number.
///
/// Pairs for one workflow name and owner are strictly increasing under
/// lexical `(major, minor)` order; the persistence layer enforces
/// uniqueness with a composite constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunNumber {
    /// Major run version; starts at 1.
    pub major: i32,
    /// Restart counter within the major version; resets to 0 on rollover.
    pub minor: i32,
}

impl RunNumber {
    /// The run number assigned to a workflow's first run.
    pub fn first() -> Self {
        Self { major: 1, minor: 0 }
    }

    /// Create a run number from stored components.
    pub fn new(major: i32, minor: i32) -> Self {
        Self { major, minor }
    }

    /// The run number for the next restart.
    ///
    /// Increments the minor component unless it has reached `max_minor`,
    /// in which case the major component increments and minor resets to
    /// zero. The rollover is a normal outcome, not a failure.
    pub fn next(self, max_minor: u32) -> RunNumber {
        if self.minor >= max_minor as i32 {
            RunNumber {
                major: self.major + 1,
                minor: 0,
            }
        } else {
            RunNumber {
                major: self.major,
                minor: self.minor + 1,
            }
        }
    }

    /// Whether the next restart from this number rolls over to a new major.
    pub fn next_rolls_over(self, max_minor: u32) -> bool {
        self.minor >= max_minor as i32
    }
}

impl std::fmt::Display for RunNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Compute the run number for a new run given the previous one.
///
/// `None` means the workflow has never run and gets [`RunNumber::first`].
pub fn next_run_number(previous: Option<RunNumber>, max_minor: u32) -> RunNumber {
    match previous {
        None => RunNumber::first(),
        Some(previous) => previous.next(max_minor),
    }
}
