//! Error types for the nodeflow engine.
//!
//! The taxonomy separates engine-level failures (consistency violations,
//! missing records, an unavailable queue) from step-level failures raised by
//! step plugins while dispatching work.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::core::Status;

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An invalid state transition was attempted.
    #[error("{0}")]
    ConsistencyViolation(#[from] ConsistencyViolation),

    /// A record could not be found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// The record kind (e.g. "node execution").
        kind: &'static str,
        /// The missing id.
        id: String,
    },

    /// The request is not valid for the current state.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The event bus could not be reached.
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    /// A completion was delivered for an already resolved correlation id.
    #[error("Duplicate notify for correlation id {0}")]
    DuplicateNotify(String),

    /// A step type, facilitator or adviser is not registered.
    #[error("Not registered: {0}")]
    NotRegistered(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persistence backend failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Creates an invalid request error.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Returns true if the failed operation may succeed when retried later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::QueueUnavailable(_) | Self::Storage(_))
    }

    /// Returns a stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConsistencyViolation(_) => "CONSISTENCY_VIOLATION",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::QueueUnavailable(_) => "QUEUE_UNAVAILABLE",
            Self::DuplicateNotify(_) => "DUPLICATE_NOTIFY",
            Self::NotRegistered(_) => "NOT_REGISTERED",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Storage(_) => "STORAGE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        if let Self::ConsistencyViolation(violation) = self {
            map.insert(
                "node_execution_id".to_string(),
                serde_json::json!(violation.node_execution_id),
            );
            map.insert("from".to_string(), serde_json::json!(violation.from));
            map.insert("to".to_string(), serde_json::json!(violation.to));
        }
        map
    }
}

/// Raised when a status transition is not allowed by the state graph.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("Invalid transition for node execution {node_execution_id}: {from} -> {to}")]
pub struct ConsistencyViolation {
    /// The node execution the transition was attempted on.
    pub node_execution_id: String,
    /// The current status.
    pub from: Status,
    /// The requested status.
    pub to: Status,
}

impl ConsistencyViolation {
    /// Creates a new consistency violation.
    #[must_use]
    pub fn new(node_execution_id: impl Into<String>, from: Status, to: Status) -> Self {
        Self {
            node_execution_id: node_execution_id.into(),
            from,
            to,
        }
    }
}

/// Errors raised by step plugins.
#[derive(Debug, Error)]
pub enum StepError {
    /// The executor could not even start the work (e.g. missing credentials).
    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    /// The step does not support the requested execution mode.
    #[error("Execution mode {mode} not supported by step type {step_type}")]
    Unsupported {
        /// The step type.
        step_type: String,
        /// The requested mode.
        mode: String,
    },

    /// Any other step failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StepError {
    /// Creates a dispatch failure.
    #[must_use]
    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch(message.into())
    }

    /// Creates an unsupported-mode error.
    #[must_use]
    pub fn unsupported(step_type: impl Into<String>, mode: impl ToString) -> Self {
        Self::Unsupported {
            step_type: step_type.into(),
            mode: mode.to_string(),
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;
