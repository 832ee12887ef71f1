//! Ambiance and levels: the address of an execution point in a nested plan.
//!
//! An [`Ambiance`] is a stack of [`Level`]s. Descending into a child appends a
//! level; moving on to a sibling truncates the current level and appends the
//! sibling's. A child's ambiance is therefore always a strict extension of its
//! parent's.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::plan::{NodeGroup, PlanNode};

/// One entry of an ambiance stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    /// The node execution id of this level.
    pub runtime_id: String,
    /// The plan node id of this level.
    pub setup_id: String,
    /// The plan node identifier.
    pub identifier: String,
    /// The step type.
    pub step_type: String,
    /// The node group (pipeline, stage, step...).
    pub group: NodeGroup,
    /// Retry attempt index, starting at 0.
    pub retry_index: u32,
    /// When the level was entered.
    pub start_ts: DateTime<Utc>,
}

impl Level {
    /// Builds a level for a plan node.
    #[must_use]
    pub fn for_node(
        runtime_id: impl Into<String>,
        node: &PlanNode,
        retry_index: u32,
        start_ts: DateTime<Utc>,
    ) -> Self {
        Self {
            runtime_id: runtime_id.into(),
            setup_id: node.uuid.clone(),
            identifier: node.identifier.clone(),
            step_type: node.step_type.clone(),
            group: node.group,
            retry_index,
            start_ts,
        }
    }
}

/// The stack of levels locating a node within a plan execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Ambiance {
    /// The plan execution id.
    pub plan_execution_id: String,
    /// The plan id.
    pub plan_id: String,
    /// Levels, root first.
    #[serde(default)]
    pub levels: Vec<Level>,
    /// Account/org/project style setup abstractions.
    #[serde(default)]
    pub setup_abstractions: HashMap<String, String>,
    /// Trigger metadata (who or what started the plan).
    #[serde(default)]
    pub trigger_metadata: HashMap<String, String>,
}

impl Ambiance {
    /// Creates an empty ambiance for a plan execution.
    #[must_use]
    pub fn new(plan_execution_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            plan_id: plan_id.into(),
            ..Default::default()
        }
    }

    /// Adds a setup abstraction.
    #[must_use]
    pub fn with_setup_abstraction(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.setup_abstractions.insert(key.into(), value.into());
        self
    }

    /// Adds trigger metadata.
    #[must_use]
    pub fn with_trigger(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.trigger_metadata.insert(key.into(), value.into());
        self
    }

    /// Returns a copy with `level` appended.
    #[must_use]
    pub fn clone_for_child(&self, level: Level) -> Self {
        let mut cloned = self.clone();
        cloned.levels.push(level);
        cloned
    }

    /// Returns a copy with the current (last) level removed.
    #[must_use]
    pub fn clone_for_finish(&self) -> Self {
        self.clone_with_levels(self.levels.len().saturating_sub(1))
    }

    /// Returns a copy keeping only the first `depth` levels.
    #[must_use]
    pub fn clone_with_levels(&self, depth: usize) -> Self {
        let mut cloned = self.clone();
        cloned.levels.truncate(depth);
        cloned
    }

    /// Returns the current (deepest) level.
    #[must_use]
    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    /// Returns the current runtime id (node execution id).
    #[must_use]
    pub fn current_runtime_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.runtime_id.as_str())
    }

    /// Returns the current setup id (plan node id).
    #[must_use]
    pub fn current_setup_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.setup_id.as_str())
    }

    /// Returns the runtime id of the parent level.
    #[must_use]
    pub fn parent_runtime_id(&self) -> Option<&str> {
        let len = self.levels.len();
        if len < 2 {
            return None;
        }
        Some(self.levels[len - 2].runtime_id.as_str())
    }

    /// Returns the nearest level belonging to `group`, searching upwards.
    #[must_use]
    pub fn nearest_level_of(&self, group: NodeGroup) -> Option<&Level> {
        self.levels.iter().rev().find(|l| l.group == group)
    }

    /// Returns the enclosing stage level.
    #[must_use]
    pub fn stage_level(&self) -> Option<&Level> {
        self.nearest_level_of(NodeGroup::Stage)
    }

    /// Returns the depth (number of levels).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Returns true if `self` is a strict extension of `parent`.
    #[must_use]
    pub fn extends(&self, parent: &Self) -> bool {
        self.plan_execution_id == parent.plan_execution_id
            && self.levels.len() > parent.levels.len()
            && self.levels[..parent.levels.len()] == parent.levels[..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(runtime_id: &str, group: NodeGroup) -> Level {
        Level {
            runtime_id: runtime_id.to_string(),
            setup_id: format!("setup-{runtime_id}"),
            identifier: runtime_id.to_string(),
            step_type: "TEST".to_string(),
            group,
            retry_index: 0,
            start_ts: Utc::now(),
        }
    }

    fn nested() -> Ambiance {
        Ambiance::new("pe1", "plan1")
            .clone_for_child(level("pipeline", NodeGroup::Pipeline))
            .clone_for_child(level("stage", NodeGroup::Stage))
            .clone_for_child(level("fork", NodeGroup::StepGroup))
            .clone_for_child(level("step", NodeGroup::Step))
    }

    #[test]
    fn test_clone_for_child_extends() {
        let parent = nested();
        let child = parent.clone_for_child(level("leaf", NodeGroup::Step));

        assert_eq!(child.depth(), 5);
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
        assert!(!parent.extends(&parent));
    }

    #[test]
    fn test_clone_for_finish_truncates() {
        let ambiance = nested();
        let finished = ambiance.clone_for_finish();

        assert_eq!(finished.depth(), 3);
        assert_eq!(finished.plan_execution_id, "pe1");
        assert_eq!(finished.current_runtime_id(), Some("fork"));
        assert_eq!(Ambiance::new("pe1", "p").clone_for_finish().depth(), 0);
    }

    #[test]
    fn test_clone_with_levels() {
        let ambiance = nested();
        assert_eq!(ambiance.clone_with_levels(0).depth(), 0);
        assert_eq!(ambiance.clone_with_levels(2).depth(), 2);
        assert_eq!(ambiance.clone_with_levels(10).depth(), 4);
    }

    #[test]
    fn test_level_getters() {
        let ambiance = nested();
        assert_eq!(ambiance.current_runtime_id(), Some("step"));
        assert_eq!(ambiance.current_setup_id(), Some("setup-step"));
        assert_eq!(ambiance.parent_runtime_id(), Some("fork"));
        assert_eq!(ambiance.stage_level().map(|l| l.runtime_id.as_str()), Some("stage"));
    }

    #[test]
    fn test_empty_ambiance_getters() {
        let ambiance = Ambiance::new("pe1", "plan1");
        assert!(ambiance.current_level().is_none());
        assert!(ambiance.current_runtime_id().is_none());
        assert!(ambiance.parent_runtime_id().is_none());
        assert!(ambiance.stage_level().is_none());
    }

    #[test]
    fn test_extends_requires_same_plan_execution() {
        let parent = nested();
        let mut other = parent.clone_for_child(level("x", NodeGroup::Step));
        other.plan_execution_id = "pe2".to_string();
        assert!(!other.extends(&parent));
    }
}
