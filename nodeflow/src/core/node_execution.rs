//! Node executions and plan executions: the persisted runtime records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use super::ambiance::Ambiance;
use super::status::Status;
use super::step::{ExecutionMode, FailureInfo, ResponseData};

/// The runtime record for one attempt at executing a plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Unique id (the runtime id of the current ambiance level).
    pub uuid: String,
    /// Position of this node in the plan execution.
    pub ambiance: Ambiance,
    /// The plan node this executes.
    pub plan_node_id: String,
    /// Plan node identifier.
    pub identifier: String,
    /// Step type.
    pub step_type: String,
    /// Current status.
    pub status: Status,
    /// Mode chosen by facilitation.
    pub mode: Option<ExecutionMode>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When execution started.
    pub start_ts: Option<DateTime<Utc>>,
    /// When the node reached a terminal status.
    pub end_ts: Option<DateTime<Utc>>,
    /// Parent node execution.
    pub parent_id: Option<String>,
    /// Previous sibling.
    pub previous_id: Option<String>,
    /// Next sibling.
    pub next_id: Option<String>,
    /// The wait instance this node is suspended on.
    pub notify_id: Option<String>,
    /// Timeouts owned by this node.
    #[serde(default)]
    pub timeout_instance_ids: Vec<String>,
    /// Timeouts scheduled by advisers (retry waits).
    #[serde(default)]
    pub adviser_timeout_instance_ids: Vec<String>,
    /// Ids of earlier attempts of this node, oldest first.
    #[serde(default)]
    pub retry_ids: Vec<String>,
    /// True once superseded by a retry.
    #[serde(default)]
    pub old_retry: bool,
    /// True while an advised retry is pending.
    #[serde(default)]
    pub awaiting_retry: bool,
    /// Failure details.
    pub failure_info: Option<FailureInfo>,
    /// Step parameters resolved for this attempt.
    #[serde(default)]
    pub step_parameters: serde_json::Value,
    /// Outputs published by the step.
    #[serde(default)]
    pub outputs: HashMap<String, serde_json::Value>,
    /// True while paused by an interrupt.
    #[serde(default)]
    pub paused: bool,
    /// True if the node was created while paused and has not run yet.
    #[serde(default)]
    pub deferred_start: bool,
    /// Callback responses that arrived while paused.
    #[serde(default)]
    pub buffered_responses: Option<HashMap<String, ResponseData>>,
    /// Child plan node ids not yet started (concurrency-limited children).
    #[serde(default)]
    pub pending_children: VecDeque<String>,
    /// Maximum children running at once.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Optimistic concurrency version, bumped on every write.
    #[serde(default)]
    pub version: u64,
}

impl NodeExecution {
    /// Creates a queued node execution at the current level of `ambiance`.
    #[must_use]
    pub fn new(ambiance: Ambiance, created_at: DateTime<Utc>) -> Self {
        let (uuid, plan_node_id, identifier, step_type) = ambiance
            .current_level()
            .map(|l| {
                (
                    l.runtime_id.clone(),
                    l.setup_id.clone(),
                    l.identifier.clone(),
                    l.step_type.clone(),
                )
            })
            .unwrap_or_default();

        Self {
            uuid,
            ambiance,
            plan_node_id,
            identifier,
            step_type,
            status: Status::Queued,
            mode: None,
            created_at,
            start_ts: None,
            end_ts: None,
            parent_id: None,
            previous_id: None,
            next_id: None,
            notify_id: None,
            timeout_instance_ids: Vec::new(),
            adviser_timeout_instance_ids: Vec::new(),
            retry_ids: Vec::new(),
            old_retry: false,
            awaiting_retry: false,
            failure_info: None,
            step_parameters: serde_json::Value::Null,
            outputs: HashMap::new(),
            paused: false,
            deferred_start: false,
            buffered_responses: None,
            pending_children: VecDeque::new(),
            max_concurrency: None,
            version: 0,
        }
    }

    /// Sets the parent.
    #[must_use]
    pub fn with_parent(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    /// Sets the previous sibling.
    #[must_use]
    pub fn with_previous(mut self, previous_id: Option<String>) -> Self {
        self.previous_id = previous_id;
        self
    }

    /// Sets the earlier attempts.
    #[must_use]
    pub fn with_retry_ids(mut self, retry_ids: Vec<String>) -> Self {
        self.retry_ids = retry_ids;
        self
    }

    /// Sets the step parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.step_parameters = parameters;
        self
    }

    /// The plan execution this node belongs to.
    #[must_use]
    pub fn plan_execution_id(&self) -> &str {
        &self.ambiance.plan_execution_id
    }

    /// Retry attempt index.
    #[must_use]
    pub fn retry_index(&self) -> u32 {
        self.ambiance.current_level().map_or(0, |l| l.retry_index)
    }

    /// Returns true if the node is suspended on an external callback.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.notify_id.is_some() && !self.status.is_terminal()
    }

    /// Returns true if the node's mode descends into children.
    #[must_use]
    pub fn is_parent(&self) -> bool {
        self.mode.is_some_and(|m| m.has_children())
    }

    /// Returns true if the node still blocks its parent from concluding.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.status.is_terminal() || self.awaiting_retry
    }
}

/// The runtime record for one run of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecution {
    /// Plan execution id.
    pub uuid: String,
    /// Plan id.
    pub plan_id: String,
    /// Current status.
    pub status: Status,
    /// Root ambiance (no levels).
    pub ambiance: Ambiance,
    /// When the plan started.
    pub start_ts: DateTime<Utc>,
    /// When the plan finished.
    pub end_ts: Option<DateTime<Utc>>,
    /// True while paused by PAUSE_ALL.
    #[serde(default)]
    pub paused: bool,
    /// Final status forced by an end-plan advise.
    #[serde(default)]
    pub status_override: Option<Status>,
    /// Plan node ids that failed in the rolled-back scope.
    #[serde(default)]
    pub rollback_failed_node_ids: Option<Vec<String>>,
    /// Optimistic concurrency version.
    #[serde(default)]
    pub version: u64,
}

impl PlanExecution {
    /// Creates a running plan execution.
    #[must_use]
    pub fn new(ambiance: Ambiance, start_ts: DateTime<Utc>) -> Self {
        Self {
            uuid: ambiance.plan_execution_id.clone(),
            plan_id: ambiance.plan_id.clone(),
            status: Status::Running,
            ambiance,
            start_ts,
            end_ts: None,
            paused: false,
            status_override: None,
            rollback_failed_node_ids: None,
            version: 0,
        }
    }

    /// Returns true if `plan_node_id` failed in the rolled-back scope.
    #[must_use]
    pub fn rollback_includes(&self, plan_node_id: &str) -> bool {
        self.rollback_failed_node_ids
            .as_ref()
            .is_some_and(|ids| ids.iter().any(|id| id == plan_node_id))
    }
}
