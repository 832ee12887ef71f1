//! Compare-and-swap writes and the status events they produce.

use tracing::{debug, error};

use super::Engine;
use crate::core::{NodeExecution, PlanExecution, Status};
use crate::errors::{ConsistencyViolation, EngineError, Result};
use crate::events::OrchestrationEvent;

/// Validates `node.status -> to` and applies it.
pub(crate) fn apply_status(node: &mut NodeExecution, to: Status) -> Result<()> {
    if !node.status.can_transition_to(to) {
        let violation = ConsistencyViolation::new(&node.uuid, node.status, to);
        error!(
            node_execution_id = %node.uuid,
            from = %node.status,
            to = %to,
            "Rejected invalid status transition"
        );
        return Err(violation.into());
    }
    node.status = to;
    Ok(())
}

impl Engine {
    /// Reads a node execution, failing if it does not exist.
    pub(crate) async fn require_node(&self, node_execution_id: &str) -> Result<NodeExecution> {
        self.nodes
            .get(node_execution_id)
            .await?
            .ok_or_else(|| EngineError::not_found("node execution", node_execution_id))
    }

    /// Reads a plan execution, failing if it does not exist.
    pub(crate) async fn require_plan_execution(&self, plan_execution_id: &str) -> Result<PlanExecution> {
        self.plans
            .get(plan_execution_id)
            .await?
            .ok_or_else(|| EngineError::not_found("plan execution", plan_execution_id))
    }

    /// Re-reads and re-applies `mutate` until the swap wins.
    ///
    /// `mutate` returns `Ok(false)` when there is nothing to write, which
    /// yields `Ok(None)`. A status change made by `mutate` is emitted as a
    /// node event after the write.
    pub(crate) async fn update_node<F>(&self, node_execution_id: &str, mut mutate: F) -> Result<Option<NodeExecution>>
    where
        F: FnMut(&mut NodeExecution) -> Result<bool> + Send,
    {
        for attempt in 1..=self.config.max_cas_attempts {
            let current = self.require_node(node_execution_id).await?;
            let mut next = current.clone();
            if !mutate(&mut next)? {
                return Ok(None);
            }

            if let Some(stored) = self.nodes.compare_and_swap(next, current.version).await? {
                if stored.status != current.status {
                    self.emit_node_status(&stored, Some(current.status)).await;
                }
                return Ok(Some(stored));
            }
            debug!(node_execution_id, attempt, "Lost compare-and-swap; retrying");
        }

        Err(EngineError::Storage(format!(
            "node execution {node_execution_id}: compare-and-swap lost {} times",
            self.config.max_cas_attempts
        )))
    }

    /// Moves a node to `to`, applying `apply` in the same write.
    ///
    /// Returns the stored record and its previous status, or `None` if the
    /// node already has status `to`. Transitions the status graph forbids
    /// are logged and rejected with a consistency violation.
    pub(crate) async fn transition<F>(
        &self,
        node_execution_id: &str,
        to: Status,
        mut apply: F,
    ) -> Result<Option<(NodeExecution, Status)>>
    where
        F: FnMut(&mut NodeExecution, Status) + Send,
    {
        let mut from = None;
        let stored = self
            .update_node(node_execution_id, |node| {
                if node.status == to {
                    return Ok(false);
                }
                let previous = node.status;
                apply_status(node, to)?;
                apply(node, previous);
                from = Some(previous);
                Ok(true)
            })
            .await?;
        Ok(stored.zip(from))
    }

    /// Compare-and-swap loop over a plan execution.
    pub(crate) async fn update_plan<F>(&self, plan_execution_id: &str, mut mutate: F) -> Result<Option<PlanExecution>>
    where
        F: FnMut(&mut PlanExecution) -> Result<bool> + Send,
    {
        for attempt in 1..=self.config.max_cas_attempts {
            let current = self.require_plan_execution(plan_execution_id).await?;
            let mut next = current.clone();
            if !mutate(&mut next)? {
                return Ok(None);
            }

            if let Some(stored) = self.plans.compare_and_swap(next, current.version).await? {
                if stored.status != current.status {
                    self.emit_plan_status(plan_execution_id, stored.status).await;
                }
                return Ok(Some(stored));
            }
            debug!(plan_execution_id, attempt, "Lost compare-and-swap; retrying");
        }

        Err(EngineError::Storage(format!(
            "plan execution {plan_execution_id}: compare-and-swap lost {} times",
            self.config.max_cas_attempts
        )))
    }

    pub(crate) async fn emit_node_status(&self, node: &NodeExecution, from: Option<Status>) {
        self.events
            .emit(&OrchestrationEvent::NodeStatusChanged {
                node_execution_id: node.uuid.clone(),
                plan_execution_id: node.plan_execution_id().to_string(),
                plan_node_id: node.plan_node_id.clone(),
                from,
                to: node.status,
            })
            .await;
    }

    pub(crate) async fn emit_plan_status(&self, plan_execution_id: &str, status: Status) {
        self.events
            .emit(&OrchestrationEvent::PlanStatusChanged {
                plan_execution_id: plan_execution_id.to_string(),
                status,
            })
            .await;
    }
}
