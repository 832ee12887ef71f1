//! Step responses and executables.
//!
//! A step's `execute` returns an [`Executable`] describing how the node
//! proceeds: a final [`StepResponse`], a set of callback ids to wait on, or
//! child nodes to descend into.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::status::Status;

/// The execution mode chosen by facilitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Completes inline.
    Sync,
    /// Dispatches work and waits for callbacks.
    Async,
    /// Delegates to an external task runner and waits for callbacks.
    Task,
    /// Descends into a single child node.
    Child,
    /// Descends into several child nodes.
    Children,
}

impl ExecutionMode {
    /// Returns true if the mode waits on external callbacks.
    #[must_use]
    pub fn awaits_callbacks(&self) -> bool {
        matches!(self, Self::Async | Self::Task)
    }

    /// Returns true if the mode descends into children.
    #[must_use]
    pub fn has_children(&self) -> bool {
        matches!(self, Self::Child | Self::Children)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Async => write!(f, "async"),
            Self::Task => write!(f, "task"),
            Self::Child => write!(f, "child"),
            Self::Children => write!(f, "children"),
        }
    }
}

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// The step's own work failed.
    Application,
    /// Work could not be dispatched to the executor.
    Dispatch,
    /// A deadline passed.
    Timeout,
    /// Credentials were missing or rejected.
    Authentication,
    /// The executor could not be reached.
    Connectivity,
    /// The engine failed to run the node.
    Engine,
    /// Unclassified.
    Unknown,
}

/// Failure details recorded on a node execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FailureInfo {
    /// Human-readable message.
    pub message: String,
    /// Failure classifications.
    #[serde(default)]
    pub failure_types: Vec<FailureType>,
}

impl FailureInfo {
    /// Creates failure info with a single classification.
    #[must_use]
    pub fn new(message: impl Into<String>, failure_type: FailureType) -> Self {
        Self {
            message: message.into(),
            failure_types: vec![failure_type],
        }
    }

    /// Returns true if the failure carries `failure_type`.
    #[must_use]
    pub fn has_type(&self, failure_type: FailureType) -> bool {
        self.failure_types.contains(&failure_type)
    }
}

/// Opaque response payload delivered by an external executor.
pub type ResponseData = serde_json::Value;

/// The final result of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    /// The terminal status the node should take.
    pub status: Status,
    /// Failure details, if any.
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    /// Outputs published by the step.
    #[serde(default)]
    pub outputs: HashMap<String, serde_json::Value>,
}

impl StepResponse {
    /// Creates a response with the given status.
    #[must_use]
    pub fn new(status: Status) -> Self {
        Self {
            status,
            failure_info: None,
            outputs: HashMap::new(),
        }
    }

    /// A successful response.
    #[must_use]
    pub fn success() -> Self {
        Self::new(Status::Succeeded)
    }

    /// A skipped response.
    #[must_use]
    pub fn skipped() -> Self {
        Self::new(Status::Skipped)
    }

    /// An aborted response.
    #[must_use]
    pub fn aborted() -> Self {
        Self::new(Status::Aborted)
    }

    /// A failed response.
    #[must_use]
    pub fn failed(message: impl Into<String>, failure_type: FailureType) -> Self {
        Self::new(Status::Failed).with_failure(FailureInfo::new(message, failure_type))
    }

    /// An errored response.
    #[must_use]
    pub fn errored(message: impl Into<String>) -> Self {
        Self::new(Status::Errored).with_failure(FailureInfo::new(message, FailureType::Engine))
    }

    /// An expired response.
    #[must_use]
    pub fn expired(message: impl Into<String>) -> Self {
        Self::new(Status::Expired).with_failure(FailureInfo::new(message, FailureType::Timeout))
    }

    /// Sets failure info.
    #[must_use]
    pub fn with_failure(mut self, failure_info: FailureInfo) -> Self {
        self.failure_info = Some(failure_info);
        self
    }

    /// Adds an output.
    #[must_use]
    pub fn with_output(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }
}

/// Returned by async and task steps: the callbacks to wait for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AsyncExecutableResponse {
    /// Correlation ids the external executor will notify.
    pub callback_ids: Vec<String>,
    /// Log keys for the dispatched work.
    #[serde(default)]
    pub log_keys: Vec<String>,
}

impl AsyncExecutableResponse {
    /// Creates a response waiting on `callback_ids`.
    #[must_use]
    pub fn new<I, S>(callback_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            callback_ids: callback_ids.into_iter().map(Into::into).collect(),
            log_keys: Vec::new(),
        }
    }
}

/// Returned by children steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChildrenExecutableResponse {
    /// Plan node ids of the children, in start order.
    pub child_node_ids: Vec<String>,
    /// Maximum number of children running at once. `None` means unbounded.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

/// What a step asks the engine to do next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Executable {
    /// Finish with this response.
    Sync(StepResponse),
    /// Wait for callbacks.
    Async(AsyncExecutableResponse),
    /// Descend into one child.
    Child {
        /// Plan node id of the child.
        child_node_id: String,
    },
    /// Descend into several children.
    Children(ChildrenExecutableResponse),
}

impl Executable {
    /// Returns true if this executable is legal for `mode`.
    #[must_use]
    pub fn matches_mode(&self, mode: ExecutionMode) -> bool {
        matches!(
            (self, mode),
            (Self::Sync(_), ExecutionMode::Sync)
                | (Self::Async(_), ExecutionMode::Async | ExecutionMode::Task)
                | (Self::Child { .. }, ExecutionMode::Child)
                | (Self::Children(_), ExecutionMode::Children)
        )
    }
}

/// A child's terminal outcome, handed to the parent step when all children
/// have finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildOutcome {
    /// Child node execution id.
    pub node_execution_id: String,
    /// Child plan node id.
    pub plan_node_id: String,
    /// Terminal status.
    pub status: Status,
    /// Failure details.
    pub failure_info: Option<FailureInfo>,
}
