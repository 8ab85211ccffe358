// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for callflow-core.
//!
//! Provides a unified error type that maps to command surface error responses.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur during request processing.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Flow was not found (absent or soft-deleted).
    FlowNotFound {
        /// The flow ID that was not found.
        flow_id: String,
    },

    /// Activeflow was not found (absent or soft-deleted).
    ActiveflowNotFound {
        /// The activeflow ID that was not found.
        activeflow_id: String,
    },

    /// Input validation failed, or a resource ceiling was exceeded.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Mutating operation attempted on a stopped or completed activeflow.
    Terminal {
        /// The activeflow ID.
        activeflow_id: String,
        /// The terminal status the activeflow is in.
        status: String,
    },

    /// The execute-count ceiling was exceeded.
    LoopDetected {
        /// The activeflow ID.
        activeflow_id: String,
        /// The execute count that tripped the guard.
        execute_count: u64,
    },

    /// Compare-and-set mismatch, another writer committed first.
    Conflict {
        /// The activeflow ID.
        activeflow_id: String,
    },

    /// A store or transport deadline was exceeded.
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Shorthand for a [`CoreError::ValidationError`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::FlowNotFound { .. } => "FLOW_NOT_FOUND",
            Self::ActiveflowNotFound { .. } => "ACTIVEFLOW_NOT_FOUND",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::Terminal { .. } => "ACTIVEFLOW_TERMINAL",
            Self::LoopDetected { .. } => "LOOP_DETECTED",
            Self::Conflict { .. } => "CONFLICT",
            Self::Timeout { .. } => "TIMEOUT",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether this error is a not-found condition for either record kind.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::FlowNotFound { .. } | Self::ActiveflowNotFound { .. }
        )
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlowNotFound { flow_id } => {
                write!(f, "Flow '{}' not found", flow_id)
            }
            Self::ActiveflowNotFound { activeflow_id } => {
                write!(f, "Activeflow '{}' not found", activeflow_id)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::Terminal {
                activeflow_id,
                status,
            } => {
                write!(
                    f,
                    "Activeflow '{}' is already {} and cannot be advanced",
                    activeflow_id, status
                )
            }
            Self::LoopDetected {
                activeflow_id,
                execute_count,
            } => {
                write!(
                    f,
                    "Activeflow '{}' exceeded the execute limit at count {}",
                    activeflow_id, execute_count
                )
            }
            Self::Conflict { activeflow_id } => {
                write!(
                    f,
                    "Activeflow '{}' was modified concurrently",
                    activeflow_id
                )
            }
            Self::Timeout { operation } => {
                write!(f, "Deadline exceeded during '{}'", operation)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_codes() {
        let test_cases = vec![
            (
                CoreError::FlowNotFound {
                    flow_id: "test-id".to_string(),
                },
                "FLOW_NOT_FOUND",
            ),
            (
                CoreError::ActiveflowNotFound {
                    activeflow_id: "test-id".to_string(),
                },
                "ACTIVEFLOW_NOT_FOUND",
            ),
            (
                CoreError::validation("actions", "unknown type"),
                "VALIDATION_ERROR",
            ),
            (
                CoreError::Terminal {
                    activeflow_id: "test-id".to_string(),
                    status: "stopped".to_string(),
                },
                "ACTIVEFLOW_TERMINAL",
            ),
            (
                CoreError::LoopDetected {
                    activeflow_id: "test-id".to_string(),
                    execute_count: 101,
                },
                "LOOP_DETECTED",
            ),
            (
                CoreError::Conflict {
                    activeflow_id: "test-id".to_string(),
                },
                "CONFLICT",
            ),
            (
                CoreError::Timeout {
                    operation: "get_activeflow".to_string(),
                },
                "TIMEOUT",
            ),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "connection refused".to_string(),
                },
                "DATABASE_ERROR",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty(), "Message should not be empty");
        }
    }

    #[test]
    fn test_core_error_display() {
        let err = CoreError::ActiveflowNotFound {
            activeflow_id: "abc-123".to_string(),
        };
        assert_eq!(err.to_string(), "Activeflow 'abc-123' not found");

        let err = CoreError::Terminal {
            activeflow_id: "abc-123".to_string(),
            status: "completed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Activeflow 'abc-123' is already completed and cannot be advanced"
        );

        let err = CoreError::validation("actions[0].type", "unknown action type 'dance'");
        assert_eq!(
            err.to_string(),
            "Validation error for 'actions[0].type': unknown action type 'dance'"
        );

        let err = CoreError::Timeout {
            operation: "update_activeflow".to_string(),
        };
        assert_eq!(err.to_string(), "Deadline exceeded during 'update_activeflow'");
    }

    #[test]
    fn test_is_not_found() {
        assert!(
            CoreError::FlowNotFound {
                flow_id: "x".to_string()
            }
            .is_not_found()
        );
        assert!(
            !CoreError::Conflict {
                activeflow_id: "x".to_string()
            }
            .is_not_found()
        );
    }
}
