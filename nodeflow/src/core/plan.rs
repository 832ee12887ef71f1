//! Compiled plans and plan nodes.
//!
//! A [`Plan`] is produced by an external plan creator and is immutable once
//! handed to the engine. Nodes reference each other only by id.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::advise::AdviserObtainment;
use crate::errors::EngineError;
use crate::facilitator::{FacilitatorObtainment, FacilitatorType};
use crate::timeout::TimeoutObtainment;

/// Structural group of a node within a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeGroup {
    /// The pipeline root.
    Pipeline,
    /// A stage.
    Stage,
    /// A group of steps (fork, parallel, step group).
    StepGroup,
    /// A rollback section.
    Rollback,
    /// A leaf step.
    #[default]
    Step,
}

impl fmt::Display for NodeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipeline => write!(f, "pipeline"),
            Self::Stage => write!(f, "stage"),
            Self::StepGroup => write!(f, "step_group"),
            Self::Rollback => write!(f, "rollback"),
            Self::Step => write!(f, "step"),
        }
    }
}

/// Condition deciding whether a node is skipped before facilitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum SkipCondition {
    /// Always skip.
    Always,
    /// An expression evaluated by the registered condition evaluator.
    Expression(String),
}

/// One node of a compiled plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    /// Unique node id (the setup id).
    pub uuid: String,
    /// User-facing identifier.
    pub identifier: String,
    /// Display name.
    pub name: String,
    /// Step type resolved through the registry.
    pub step_type: String,
    /// Structural group.
    #[serde(default)]
    pub group: NodeGroup,
    /// How the execution mode is decided.
    pub facilitator_obtainment: FacilitatorObtainment,
    /// Advisers, evaluated in order.
    #[serde(default)]
    pub adviser_obtainments: Vec<AdviserObtainment>,
    /// Deadlines applied while the node runs.
    #[serde(default)]
    pub timeout_obtainments: Vec<TimeoutObtainment>,
    /// Optional skip condition.
    #[serde(default)]
    pub skip_condition: Option<SkipCondition>,
    /// Parameters handed to the step.
    #[serde(default)]
    pub step_parameters: serde_json::Value,
    /// For rollback steps: the plan node this step undoes.
    #[serde(default)]
    pub rollback_target: Option<String>,
}

impl PlanNode {
    /// Creates a sync step node.
    #[must_use]
    pub fn new(uuid: impl Into<String>, step_type: impl Into<String>) -> Self {
        let uuid = uuid.into();
        Self {
            identifier: uuid.clone(),
            name: uuid.clone(),
            uuid,
            step_type: step_type.into(),
            group: NodeGroup::Step,
            facilitator_obtainment: FacilitatorObtainment::new(FacilitatorType::Sync),
            adviser_obtainments: Vec::new(),
            timeout_obtainments: Vec::new(),
            skip_condition: None,
            step_parameters: serde_json::Value::Null,
            rollback_target: None,
        }
    }

    /// Sets the identifier.
    #[must_use]
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the group.
    #[must_use]
    pub fn with_group(mut self, group: NodeGroup) -> Self {
        self.group = group;
        self
    }

    /// Sets the facilitator type.
    #[must_use]
    pub fn with_facilitator(mut self, facilitator_type: FacilitatorType) -> Self {
        self.facilitator_obtainment = FacilitatorObtainment::new(facilitator_type);
        self
    }

    /// Appends an adviser obtainment.
    #[must_use]
    pub fn with_adviser(mut self, obtainment: AdviserObtainment) -> Self {
        self.adviser_obtainments.push(obtainment);
        self
    }

    /// Appends a timeout obtainment.
    #[must_use]
    pub fn with_timeout(mut self, obtainment: TimeoutObtainment) -> Self {
        self.timeout_obtainments.push(obtainment);
        self
    }

    /// Sets the skip condition.
    #[must_use]
    pub fn with_skip_condition(mut self, condition: SkipCondition) -> Self {
        self.skip_condition = Some(condition);
        self
    }

    /// Sets the step parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.step_parameters = parameters;
        self
    }

    /// Marks this node as the rollback of `target`.
    #[must_use]
    pub fn with_rollback_target(mut self, target: impl Into<String>) -> Self {
        self.rollback_target = Some(target.into());
        self
    }

    /// Node ids referenced by this node's advisers.
    #[must_use]
    pub fn referenced_node_ids(&self) -> Vec<&str> {
        self.adviser_obtainments
            .iter()
            .flat_map(AdviserObtainment::referenced_node_ids)
            .collect()
    }
}

/// A compiled, immutable plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Plan id.
    pub uuid: String,
    /// Nodes keyed by uuid.
    pub nodes: HashMap<String, PlanNode>,
    /// The node execution starts from.
    pub starting_node_id: String,
}

impl Plan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new(uuid: impl Into<String>, starting_node_id: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            nodes: HashMap::new(),
            starting_node_id: starting_node_id.into(),
        }
    }

    /// Adds a node.
    #[must_use]
    pub fn with_node(mut self, node: PlanNode) -> Self {
        self.nodes.insert(node.uuid.clone(), node);
        self
    }

    /// Looks up a node.
    #[must_use]
    pub fn node(&self, uuid: &str) -> Option<&PlanNode> {
        self.nodes.get(uuid)
    }

    /// Validates internal references.
    ///
    /// # Errors
    ///
    /// Returns an error if the starting node is missing or an adviser or
    /// rollback target references an unknown node.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.nodes.is_empty() {
            return Err(EngineError::invalid(format!("Plan '{}' has no nodes", self.uuid)));
        }
        if !self.nodes.contains_key(&self.starting_node_id) {
            return Err(EngineError::invalid(format!(
                "Starting node '{}' not found in plan '{}'",
                self.starting_node_id, self.uuid
            )));
        }

        for node in self.nodes.values() {
            for referenced in node.referenced_node_ids() {
                if !self.nodes.contains_key(referenced) {
                    return Err(EngineError::invalid(format!(
                        "Node '{}' references unknown node '{}'",
                        node.uuid, referenced
                    )));
                }
            }
            if let Some(ref target) = node.rollback_target {
                if !self.nodes.contains_key(target) {
                    return Err(EngineError::invalid(format!(
                        "Rollback node '{}' targets unknown node '{}'",
                        node.uuid, target
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_node_builder() {
        let node = PlanNode::new("n1", "ShellScript")
            .with_identifier("shell")
            .with_group(NodeGroup::Stage)
            .with_facilitator(FacilitatorType::Async)
            .with_parameters(serde_json::json!({"script": "echo"}));

        assert_eq!(node.identifier, "shell");
        assert_eq!(node.group, NodeGroup::Stage);
        assert_eq!(node.facilitator_obtainment.facilitator_type, FacilitatorType::Async);
        assert_eq!(node.step_parameters["script"], "echo");
    }

    #[test]
    fn test_plan_validate_ok() {
        let plan = Plan::new("p1", "a")
            .with_node(PlanNode::new("a", "T").with_adviser(AdviserObtainment::next_step("b")))
            .with_node(PlanNode::new("b", "T"));

        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_plan_validate_missing_start() {
        let plan = Plan::new("p1", "missing").with_node(PlanNode::new("a", "T"));
        assert!(plan.validate().is_err());
        assert!(Plan::new("p1", "a").validate().is_err());
    }

    #[test]
    fn test_plan_validate_dangling_reference() {
        let plan = Plan::new("p1", "a")
            .with_node(PlanNode::new("a", "T").with_adviser(AdviserObtainment::next_step("zzz")));
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("zzz"));

        let plan = Plan::new("p1", "a")
            .with_node(PlanNode::new("a", "T").with_rollback_target("nope"));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_skip_condition_serde() {
        let json = serde_json::to_value(SkipCondition::Expression("true".into())).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "expression", "value": "true"}));
    }
}
