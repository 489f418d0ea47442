//! Error types for the brick control plane
//!
//! Provides the structured error taxonomy shared by the registry, the
//! topology planner, the task orchestrator and the node agent boundary.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Planning Errors
// =============================================================================

/// A placement constraint the planner could not satisfy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanningError {
    #[error("insufficient nodes: need {required} online nodes, {available} available")]
    InsufficientNodes { required: usize, available: usize },

    #[error("insufficient capacity: need {required} nodes with {brick_size_bytes} free bytes, {available} available")]
    InsufficientCapacity {
        required: usize,
        available: usize,
        brick_size_bytes: u64,
    },

    #[error("port exhaustion on node {node_id}: no free port in {base}..={max}")]
    PortExhausted { node_id: String, base: u16, max: u16 },
}

// =============================================================================
// Control Plane Error
// =============================================================================

/// Unified error type for the control plane
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {reason}")]
    Conflict { reason: String, transient: bool },

    #[error("Planning failed: {0}")]
    Planning(#[from] PlanningError),

    #[error("Not found: {kind}/{id}")]
    NotFound { kind: String, id: String },

    // =========================================================================
    // Node Agent Errors
    // =========================================================================
    #[error("Node agent acknowledgment timed out: {operation} on {node} after {timeout:?}")]
    ExternalTimeout {
        node: String,
        operation: String,
        timeout: Duration,
    },

    #[error("Brick launcher failed for {brick}: {reason}")]
    Launcher { brick: String, reason: String },

    #[error("Task cancelled")]
    Cancelled,

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serializable classification of an [`Error`], recorded on failed tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    Planning,
    NotFound,
    ExternalTimeout,
    Launcher,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Planning => "planning",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ExternalTimeout => "external_timeout",
            ErrorKind::Launcher => "launcher",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// Action to take when a task step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry the step with exponential backoff
    RetryWithBackoff,
    /// Fail the task immediately
    FailTask,
}

impl Error {
    /// Conflict that the caller should not retry
    pub fn conflict(reason: impl Into<String>) -> Self {
        Error::Conflict {
            reason: reason.into(),
            transient: false,
        }
    }

    /// Conflict caused by momentary registry contention
    pub fn transient_conflict(reason: impl Into<String>) -> Self {
        Error::Conflict {
            reason: reason.into(),
            transient: true,
        }
    }

    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::Configuration(_) => ErrorKind::Validation,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::Planning(_) => ErrorKind::Planning,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::ExternalTimeout { .. } => ErrorKind::ExternalTimeout,
            Error::Launcher { .. } => ErrorKind::Launcher,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Internal(_) | Error::Json(_) | Error::Yaml(_) | Error::Io(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Determine what the orchestrator does with a failed step
    pub fn action(&self) -> ErrorAction {
        if self.is_transient() {
            ErrorAction::RetryWithBackoff
        } else {
            ErrorAction::FailTask
        }
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Error::ExternalTimeout { .. } => true,
            Error::Conflict { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self.action(), ErrorAction::RetryWithBackoff)
    }
}

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::ExternalTimeout {
            node: "node-1".into(),
            operation: "publish".into(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.action(), ErrorAction::RetryWithBackoff);
        assert_eq!(err.kind(), ErrorKind::ExternalTimeout);

        let err = Error::Launcher {
            brick: "host-1:bricks-gv0-brick0".into(),
            reason: "exit code 1".into(),
        };
        assert_eq!(err.action(), ErrorAction::FailTask);
        assert_eq!(err.kind(), ErrorKind::Launcher);
    }

    #[test]
    fn test_conflict_classification() {
        assert!(Error::transient_conflict("registry busy").is_retryable());
        assert!(!Error::conflict("task already active").is_retryable());
        assert_eq!(Error::conflict("dup").kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_planning_error_message() {
        let err: Error = PlanningError::InsufficientNodes {
            required: 2,
            available: 1,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Planning);
        assert!(err.to_string().contains("need 2 online nodes"));
        assert!(!err.is_transient());
    }
}
