//! Persistence seams for node and plan executions.
//!
//! Every write is a compare-and-swap on the record's `version`. Callers
//! re-read and reconcile when a swap loses a race.

mod memory;

pub use memory::{InMemoryNodeExecutionStore, InMemoryPlanExecutionStore};

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use crate::core::{NodeExecution, Plan, PlanExecution, Status};
use crate::errors::Result;

/// Storage for node executions.
#[async_trait]
pub trait NodeExecutionStore: Send + Sync {
    /// Inserts a new record. Returns false if the id already exists.
    async fn insert(&self, node: NodeExecution) -> Result<bool>;

    /// Reads a record.
    async fn get(&self, node_execution_id: &str) -> Result<Option<NodeExecution>>;

    /// Replaces the record if its stored version equals `expected_version`.
    ///
    /// Returns the stored record with its bumped version, or `None` if the
    /// swap lost.
    async fn compare_and_swap(
        &self,
        node: NodeExecution,
        expected_version: u64,
    ) -> Result<Option<NodeExecution>>;

    /// Children of `parent_id` in creation order.
    async fn fetch_children(
        &self,
        parent_id: &str,
        include_old_retries: bool,
    ) -> Result<Vec<NodeExecution>>;

    /// Every node of a plan execution in creation order.
    async fn fetch_by_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>>;

    /// Deletes records, returning those that existed.
    async fn delete_many(&self, node_execution_ids: &[String]) -> Result<Vec<NodeExecution>>;

    /// Counts the latest-attempt children of `parent_id` whose status is in
    /// `statuses`.
    async fn count_children_with_status(&self, parent_id: &str, statuses: &[Status]) -> Result<usize> {
        Ok(self
            .fetch_children(parent_id, false)
            .await?
            .iter()
            .filter(|c| statuses.contains(&c.status))
            .count())
    }

    /// Nodes of a plan execution that are not yet terminal.
    async fn fetch_non_terminal(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        Ok(self
            .fetch_by_plan_execution(plan_execution_id)
            .await?
            .into_iter()
            .filter(|n| !n.status.is_terminal())
            .collect())
    }

    /// All descendants of `node_execution_id`, parents before children.
    ///
    /// Walks child ids through the store rather than holding the tree.
    async fn fetch_descendants(
        &self,
        node_execution_id: &str,
        include_old_retries: bool,
    ) -> Result<Vec<NodeExecution>> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![node_execution_id.to_string()];

        while let Some(id) = stack.pop() {
            let children = self.fetch_children(&id, include_old_retries).await?;
            for child in children.into_iter().rev() {
                if seen.insert(child.uuid.clone()) {
                    stack.push(child.uuid.clone());
                    out.push(child);
                }
            }
        }
        Ok(out)
    }
}

/// Notified when node executions are pruned, so derived records can be
/// cleaned up.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeDeleteObserver: Send + Sync {
    /// Called with the deleted records.
    async fn on_nodes_delete(&self, nodes: &[NodeExecution]) -> Result<()>;
}

/// Storage for plans and plan executions.
#[async_trait]
pub trait PlanExecutionStore: Send + Sync {
    /// Stores the plan run by a plan execution.
    async fn save_plan(&self, plan_execution_id: &str, plan: Plan) -> Result<()>;

    /// Reads the plan run by a plan execution.
    async fn get_plan(&self, plan_execution_id: &str) -> Result<Option<Arc<Plan>>>;

    /// Inserts a plan execution. Returns false if it already exists.
    async fn insert(&self, execution: PlanExecution) -> Result<bool>;

    /// Reads a plan execution.
    async fn get(&self, plan_execution_id: &str) -> Result<Option<PlanExecution>>;

    /// Replaces the record if its stored version equals `expected_version`.
    async fn compare_and_swap(
        &self,
        execution: PlanExecution,
        expected_version: u64,
    ) -> Result<Option<PlanExecution>>;
}
