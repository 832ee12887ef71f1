//! Conclusion: the terminal write, advise handling, parent barriers and plan
//! completion.

use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, warn};

use super::start::child_request;
use super::Engine;
use crate::advise::{evaluate, Advise, AdvisingEvent, RollbackPhase};
use crate::core::{worst_status, ChildOutcome, NodeExecution, Status, StepResponse};
use crate::errors::{EngineError, Result};
use crate::events::{EngineMessage, StartNodeRequest};
use crate::interrupts::{InterruptRequest, InterruptType};
use crate::steps::StepContext;
use crate::timeout::TimeoutCallback;
use crate::utils::derive_id;

/// Id of the sibling that follows `node_execution_id` at `next_plan_node_id`.
fn next_execution_id(node_execution_id: &str, next_plan_node_id: &str) -> String {
    derive_id(&[node_execution_id, "next", next_plan_node_id])
}

fn successor_plan_node(advise: &Advise) -> Option<&str> {
    match advise {
        Advise::NextStep { next_node_id }
        | Advise::MarkSuccess { next_node_id }
        | Advise::Ignore { next_node_id } => next_node_id.as_deref(),
        Advise::Rollback {
            rollback_node_id, ..
        } => Some(rollback_node_id.as_str()),
        Advise::Retry { .. } | Advise::EndPlan => None,
    }
}

/// Counts nodes that are pending, or whose successor record does not exist
/// yet.
fn count_pending(nodes: &[NodeExecution]) -> usize {
    let known: HashSet<&str> = nodes.iter().map(|n| n.uuid.as_str()).collect();
    nodes
        .iter()
        .filter(|n| {
            n.is_pending()
                || n.next_id
                    .as_deref()
                    .is_some_and(|next| !known.contains(next))
        })
        .count()
}

impl Engine {
    /// Moves a node to the terminal status of `response` and acts on it.
    ///
    /// Advisers are evaluated inside the same write, so a node that will be
    /// retried is never observed as finished by its parent.
    pub(crate) async fn conclude(&self, node_execution_id: &str, response: StepResponse) -> Result<()> {
        let response = if response.status.is_terminal() {
            response
        } else {
            StepResponse::errored(format!("Step returned non-terminal status {}", response.status))
        };

        let node = self.require_node(node_execution_id).await?;
        let plan = self.plan_for(node.plan_execution_id()).await?;
        let obtainments = plan
            .node(&node.plan_node_id)
            .map(|n| n.adviser_obtainments.clone())
            .unwrap_or_default();

        let now = self.clock.now();
        let registry = self.registry.as_ref();
        let mut advise = None;
        let concluded = self
            .transition(node_execution_id, response.status, |n, from| {
                n.end_ts = Some(now);
                n.failure_info.clone_from(&response.failure_info);
                n.outputs.extend(response.outputs.clone());

                advise = None;
                if n.status != Status::Aborted {
                    advise = match evaluate(&obtainments, &AdvisingEvent::new(n.clone(), from), registry) {
                        Ok(advise) => advise,
                        Err(err) => {
                            warn!(node_execution_id = %n.uuid, error = %err, "Adviser failed; no advise");
                            None
                        }
                    };
                }
                n.awaiting_retry = matches!(advise, Some(Advise::Retry { .. }));
                n.next_id = advise
                    .as_ref()
                    .and_then(successor_plan_node)
                    .map(|next| next_execution_id(&n.uuid, next));
            })
            .await?;

        let Some((node, from)) = concluded else {
            debug!(node_execution_id, "Node already concluded");
            return Ok(());
        };

        info!(
            node_execution_id,
            plan_node_id = %node.plan_node_id,
            from = %from,
            status = %node.status,
            advise = ?advise,
            "Node concluded"
        );

        self.timeouts.cancel(&node.timeout_instance_ids).await?;
        self.restraints.withdraw(&node.uuid).await?;
        self.release_restraints(&node.uuid).await?;
        self.apply_advise(node, advise).await
    }

    /// Finishes the restraint tickets held by `release_entity_id` and queues
    /// promotion of the affected units.
    pub(crate) async fn release_restraints(&self, release_entity_id: &str) -> Result<()> {
        for (restraint_id, resource_unit) in self.restraints.release(release_entity_id).await? {
            EngineMessage::PromoteRestraint {
                restraint_id,
                resource_unit,
            }
            .publish(self.bus.as_ref())
            .await?;
        }
        Ok(())
    }

    async fn apply_advise(&self, node: NodeExecution, advise: Option<Advise>) -> Result<()> {
        match advise {
            None => self.publish_concluded(&node.uuid).await,
            Some(Advise::NextStep { next_node_id }) => self.proceed(&node, next_node_id).await,
            Some(Advise::Retry {
                wait_interval_ms, ..
            }) => {
                if wait_interval_ms == 0 {
                    return self.create_retry(&node.uuid).await.map(|_| ());
                }
                let timeout_id = self
                    .timeouts
                    .schedule_after(
                        wait_interval_ms,
                        TimeoutCallback::RetryAfterWait {
                            node_execution_id: node.uuid.clone(),
                        },
                    )
                    .await?;
                self.update_node(&node.uuid, |n| {
                    n.adviser_timeout_instance_ids.push(timeout_id.clone());
                    Ok(true)
                })
                .await?;
                debug!(node_execution_id = %node.uuid, wait_interval_ms, "Retry scheduled");
                Ok(())
            }
            Some(Advise::MarkSuccess { next_node_id }) => {
                self.transition(&node.uuid, Status::Succeeded, |_, _| {})
                    .await?;
                self.proceed(&node, next_node_id).await
            }
            Some(Advise::Ignore { next_node_id }) => {
                self.transition(&node.uuid, Status::IgnoreFailed, |_, _| {})
                    .await?;
                self.proceed(&node, next_node_id).await
            }
            Some(Advise::EndPlan) => self.end_plan(&node).await,
            Some(Advise::Rollback {
                phase,
                rollback_node_id,
            }) => self.start_rollback(&node, phase, &rollback_node_id).await,
        }
    }

    pub(crate) async fn publish_concluded(&self, node_execution_id: &str) -> Result<()> {
        EngineMessage::NodeConcluded {
            node_execution_id: node_execution_id.to_string(),
        }
        .publish(self.bus.as_ref())
        .await?;
        Ok(())
    }

    /// Starts the next sibling, or hands control back to the parent.
    async fn proceed(&self, node: &NodeExecution, next_node_id: Option<String>) -> Result<()> {
        let Some(next_node_id) = next_node_id else {
            return self.publish_concluded(&node.uuid).await;
        };

        let request = StartNodeRequest {
            node_execution_id: next_execution_id(&node.uuid, &next_node_id),
            plan_node_id: next_node_id,
            ambiance: node.ambiance.clone_for_finish(),
            parent_id: node.parent_id.clone(),
            previous_id: Some(node.uuid.clone()),
            retry_index: 0,
            retry_ids: Vec::new(),
        };
        let next_id = request.node_execution_id.clone();
        self.update_node(&node.uuid, |n| {
            if n.next_id.as_deref() == Some(next_id.as_str()) {
                return Ok(false);
            }
            n.next_id = Some(next_id.clone());
            Ok(true)
        })
        .await?;
        self.enqueue_start(request).await
    }

    /// Creates a new attempt of a broken node. Returns false if the node was
    /// already superseded.
    pub(crate) async fn create_retry(&self, node_execution_id: &str) -> Result<bool> {
        let node = self.require_node(node_execution_id).await?;
        if node.old_retry {
            debug!(node_execution_id, "Node already retried");
            return Ok(false);
        }
        if !node.status.is_broken() {
            return Err(EngineError::invalid(format!(
                "Cannot retry node execution {node_execution_id} in status {}",
                node.status
            )));
        }

        let mut retry_ids = node.retry_ids.clone();
        retry_ids.push(node.uuid.clone());
        let request = StartNodeRequest {
            node_execution_id: derive_id(&[&node.uuid, "retry"]),
            plan_node_id: node.plan_node_id.clone(),
            ambiance: node.ambiance.clone_for_finish(),
            parent_id: node.parent_id.clone(),
            previous_id: node.previous_id.clone(),
            retry_index: node.retry_index() + 1,
            retry_ids,
        };

        // The new attempt must exist before the old one stops counting as
        // pending.
        self.create_node(&request).await?;
        self.timeouts
            .cancel(&node.adviser_timeout_instance_ids)
            .await?;
        self.update_node(node_execution_id, |n| {
            n.old_retry = true;
            n.awaiting_retry = false;
            n.adviser_timeout_instance_ids.clear();
            Ok(true)
        })
        .await?;

        info!(
            node_execution_id,
            retry_node_execution_id = %request.node_execution_id,
            retry_index = request.retry_index,
            "Retrying node"
        );
        EngineMessage::StartNode(request)
            .publish(self.bus.as_ref())
            .await?;
        Ok(true)
    }

    async fn end_plan(&self, node: &NodeExecution) -> Result<()> {
        let status = node.status;
        let plan_execution_id = node.plan_execution_id();
        self.update_plan(plan_execution_id, |p| {
            if p.status.is_terminal() || p.status_override.is_some() {
                return Ok(false);
            }
            p.status_override = Some(status);
            Ok(true)
        })
        .await?;

        let request = InterruptRequest::for_plan(plan_execution_id, InterruptType::AbortAll)
            .with_metadata("issued_by", "end_plan_advise")
            .with_metadata("node_execution_id", node.uuid.clone());
        match self.interrupts.register_interrupt(request).await {
            Ok(_) => {}
            Err(err) if err.is_transient() => return Err(err),
            Err(err) => debug!(error = %err, "End-plan abort not registered"),
        }
        self.publish_concluded(&node.uuid).await
    }

    async fn start_rollback(
        &self,
        node: &NodeExecution,
        phase: RollbackPhase,
        rollback_node_id: &str,
    ) -> Result<()> {
        let scope_id = match phase {
            RollbackPhase::Step => Some(node.uuid.as_str()),
            RollbackPhase::Stage => node.ambiance.stage_level().map(|l| l.runtime_id.as_str()),
            RollbackPhase::Pipeline => node.ambiance.levels.first().map(|l| l.runtime_id.as_str()),
        }
        .unwrap_or(node.uuid.as_str());

        let info = self.rollback.publish_rollback_information(scope_id).await?;
        self.update_plan(node.plan_execution_id(), |p| {
            let mut ids: BTreeSet<String> = p
                .rollback_failed_node_ids
                .clone()
                .unwrap_or_default()
                .into_iter()
                .collect();
            ids.extend(info.failed_node_ids.iter().cloned());
            p.rollback_failed_node_ids = Some(ids.into_iter().collect());
            Ok(true)
        })
        .await?;

        info!(
            node_execution_id = %node.uuid,
            phase = ?phase,
            rollback_node_id,
            failed = ?info.failed_node_ids,
            "Starting rollback"
        );
        self.proceed(node, Some(rollback_node_id.to_string())).await
    }

    /// A node finished its sibling chain: re-evaluate its parent, or the
    /// plan for a root node.
    pub(crate) async fn handle_concluded(&self, node_execution_id: &str) -> Result<()> {
        let Some(node) = self.nodes.get(node_execution_id).await? else {
            debug!(node_execution_id, "Concluded node no longer exists");
            return Ok(());
        };
        match &node.parent_id {
            Some(parent_id) => self.evaluate_parent(parent_id).await,
            None => self.maybe_end_plan(node.plan_execution_id()).await,
        }
    }

    /// Starts parked children while there is capacity, then concludes the
    /// parent once nothing below it is pending.
    pub(crate) async fn evaluate_parent(&self, parent_id: &str) -> Result<()> {
        let Some(parent) = self.nodes.get(parent_id).await? else {
            return Ok(());
        };
        if parent.status.is_terminal()
            || (parent.paused && parent.status != Status::Discontinuing)
        {
            return Ok(());
        }

        let children = self.nodes.fetch_children(parent_id, false).await?;
        let active = count_pending(&children);

        if !parent.pending_children.is_empty() && parent.status != Status::Discontinuing {
            return self.start_parked_children(&parent, active).await;
        }
        if active > 0 {
            return Ok(());
        }

        if parent.status == Status::Discontinuing {
            return self.conclude(parent_id, StepResponse::aborted()).await;
        }
        let outcomes: Vec<ChildOutcome> = children
            .iter()
            .map(|c| ChildOutcome {
                node_execution_id: c.uuid.clone(),
                plan_node_id: c.plan_node_id.clone(),
                status: c.status,
                failure_info: c.failure_info.clone(),
            })
            .collect();
        self.conclude_parent(&parent, &outcomes).await
    }

    async fn start_parked_children(&self, parent: &NodeExecution, active: usize) -> Result<()> {
        let capacity = parent
            .max_concurrency
            .map_or(usize::MAX, |m| m.max(1))
            .saturating_sub(active);
        let batch: Vec<String> = parent
            .pending_children
            .iter()
            .take(capacity)
            .cloned()
            .collect();
        if batch.is_empty() {
            return Ok(());
        }

        let requests: Vec<StartNodeRequest> = batch.iter().map(|id| child_request(parent, id)).collect();
        for request in &requests {
            self.create_node(request).await?;
        }
        self.update_node(&parent.uuid, |p| {
            let mut changed = false;
            for id in &batch {
                if p.pending_children.front() == Some(id) {
                    p.pending_children.pop_front();
                    changed = true;
                }
            }
            Ok(changed)
        })
        .await?;
        for request in requests {
            EngineMessage::StartNode(request)
                .publish(self.bus.as_ref())
                .await?;
        }
        debug!(parent_id = %parent.uuid, started = batch.len(), "Started parked children");
        Ok(())
    }

    /// Concludes a parent through its step's children reduction.
    pub(crate) async fn conclude_parent(&self, parent: &NodeExecution, outcomes: &[ChildOutcome]) -> Result<()> {
        let plan = self.plan_for(parent.plan_execution_id()).await?;
        let response = match (plan.node(&parent.plan_node_id), self.registry.step(&parent.step_type)) {
            (Some(plan_node), Ok(step)) => {
                let ctx = StepContext::new(parent, plan_node);
                step.handle_children_response(&ctx, outcomes).await
            }
            (None, _) => StepResponse::errored(format!("Plan node '{}' not found", parent.plan_node_id)),
            (_, Err(err)) => StepResponse::errored(err.to_string()),
        };
        self.conclude(&parent.uuid, response).await
    }

    /// Finishes the plan execution once every node is done.
    pub(crate) async fn maybe_end_plan(&self, plan_execution_id: &str) -> Result<()> {
        let execution = self.require_plan_execution(plan_execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(());
        }

        let nodes = self.nodes.fetch_by_plan_execution(plan_execution_id).await?;
        if count_pending(&nodes) > 0 {
            return Ok(());
        }

        let roots = nodes
            .iter()
            .filter(|n| n.parent_id.is_none() && !n.old_retry)
            .map(|n| n.status);
        let status = match execution.status_override {
            Some(status) => status,
            None if execution.status == Status::Discontinuing => Status::Aborted,
            None => worst_status(roots),
        };

        let now = self.clock.now();
        let ended = self
            .update_plan(plan_execution_id, |p| {
                if p.status.is_terminal() {
                    return Ok(false);
                }
                p.status = status;
                p.end_ts = Some(now);
                p.paused = false;
                Ok(true)
            })
            .await?;
        if ended.is_none() {
            return Ok(());
        }

        info!(plan_execution_id, status = %status, "Plan execution finished");
        self.release_restraints(plan_execution_id).await?;
        if self.config.prune_on_completion {
            self.prune_plan(plan_execution_id).await?;
        }
        Ok(())
    }
}
