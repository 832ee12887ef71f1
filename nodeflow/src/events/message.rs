//! Typed units of work carried on the bus.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::bus::{EventBus, Message, Topic};
use crate::core::{Ambiance, ResponseData};
use crate::errors::Result;
use crate::timeout::TimeoutCallback;

/// Request to create and run a node execution.
///
/// The node execution id is chosen by the publisher, so a redelivered start
/// finds the existing record and does nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartNodeRequest {
    /// Id of the node execution to create.
    pub node_execution_id: String,
    /// Plan node to run.
    pub plan_node_id: String,
    /// Ambiance the node's level is appended to.
    pub ambiance: Ambiance,
    /// Parent node execution.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Previous sibling.
    #[serde(default)]
    pub previous_id: Option<String>,
    /// Retry attempt index.
    #[serde(default)]
    pub retry_index: u32,
    /// Earlier attempts, oldest first.
    #[serde(default)]
    pub retry_ids: Vec<String>,
}

/// A unit of work for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EngineMessage {
    /// Create and run a node.
    StartNode(StartNodeRequest),
    /// A wait resolved; resume the node with the collected responses.
    ResumeNode {
        /// Node execution id.
        node_execution_id: String,
        /// The resolved wait.
        notify_id: String,
        /// Responses keyed by correlation id.
        responses: HashMap<String, ResponseData>,
    },
    /// A node reached its final status; re-evaluate its parent or plan.
    NodeConcluded {
        /// Node execution id.
        node_execution_id: String,
    },
    /// Apply a registered interrupt.
    ProcessInterrupt {
        /// Interrupt id.
        interrupt_id: String,
    },
    /// A timeout instance fired.
    TimeoutFired {
        /// Timeout instance id.
        timeout_instance_id: String,
        /// What to do.
        callback: TimeoutCallback,
    },
    /// Promote blocked restraint instances.
    PromoteRestraint {
        /// Restraint id.
        restraint_id: String,
        /// Resource unit.
        resource_unit: String,
    },
}

impl EngineMessage {
    /// The topic this message travels on.
    #[must_use]
    pub fn topic(&self) -> Topic {
        match self {
            Self::StartNode(_) => Topic::NodeStart,
            Self::ResumeNode { .. } => Topic::NodeResume,
            Self::NodeConcluded { .. } => Topic::NodeConcluded,
            Self::ProcessInterrupt { .. } => Topic::Interrupt,
            Self::TimeoutFired { .. } => Topic::Timeout,
            Self::PromoteRestraint { .. } => Topic::Restraint,
        }
    }

    /// Short message kind, recorded in metadata.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartNode(_) => "start_node",
            Self::ResumeNode { .. } => "resume_node",
            Self::NodeConcluded { .. } => "node_concluded",
            Self::ProcessInterrupt { .. } => "process_interrupt",
            Self::TimeoutFired { .. } => "timeout_fired",
            Self::PromoteRestraint { .. } => "promote_restraint",
        }
    }

    /// Publishes this message on its topic.
    pub async fn publish(&self, bus: &dyn EventBus) -> Result<String> {
        let mut metadata = HashMap::new();
        metadata.insert("message_type".to_string(), self.kind().to_string());
        bus.publish(self.topic(), serde_json::to_value(self)?, metadata).await
    }

    /// Decodes a bus message.
    pub fn decode(message: &Message) -> Result<Self> {
        Ok(serde_json::from_value(message.payload.clone())?)
    }
}
