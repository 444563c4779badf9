// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for flowtide-db.
//!
//! Provides a unified error type with stable error codes for API layers.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur during persistence and accounting operations.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Workflow was not found in the database.
    WorkflowNotFound {
        /// The workflow ID that was not found.
        workflow_id: String,
    },

    /// Job was not found in the database.
    JobNotFound {
        /// The job ID that was not found.
        job_id: String,
    },

    /// User was not found in the database.
    UserNotFound {
        /// The user ID that was not found.
        user_id: String,
    },

    /// Requested status change is not reachable from the current status.
    ///
    /// Rejected synchronously, never retried.
    InvalidTransition {
        /// Whether the transition concerned a workflow or a job.
        kind: &'static str,
        /// The current status.
        current: String,
        /// The requested status.
        requested: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    ///
    /// Continuable in the context of a reconciliation pass: the failing
    /// subject is skipped and the pass moves on.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// The underlying store is unreachable.
    ///
    /// Systemic: aborts the current reconciliation pass.
    StoreUnavailable {
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::WorkflowNotFound { .. } => "WORKFLOW_NOT_FOUND",
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::UserNotFound { .. } => "USER_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
        }
    }

    /// Whether this error indicates the store itself is unreachable.
    ///
    /// A systemic error aborts a reconciliation pass; any other error is
    /// isolated to one subject and the pass continues.
    pub fn is_systemic(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowNotFound { workflow_id } => {
                write!(f, "Workflow '{}' not found", workflow_id)
            }
            Self::JobNotFound { job_id } => {
                write!(f, "Job '{}' not found", job_id)
            }
            Self::UserNotFound { user_id } => {
                write!(f, "User '{}' not found", user_id)
            }
            Self::InvalidTransition {
                kind,
                current,
                requested,
            } => {
                write!(
                    f,
                    "{} cannot transition from '{}' to '{}'",
                    kind, current, requested
                )
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::StoreUnavailable { details } => {
                write!(f, "Store unavailable: {}", details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                CoreError::StoreUnavailable {
                    details: err.to_string(),
                }
            }
            _ => CoreError::DatabaseError {
                operation: "query".to_string(),
                details: err.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
