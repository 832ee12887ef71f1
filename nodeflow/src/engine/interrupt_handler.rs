//! Applying interrupts.

use tracing::{debug, error, info};

use super::transitions::apply_status;
use super::Engine;
use crate::core::{FailureType, NodeExecution, Status, StepResponse};
use crate::errors::Result;
use crate::events::OrchestrationEvent;
use crate::interrupts::{Interrupt, InterruptState, InterruptType};
use crate::steps::StepContext;
use crate::timeout::{TimeoutCallback, TimeoutEvent};

impl Engine {
    pub(crate) async fn handle_interrupt(&self, interrupt_id: &str) -> Result<()> {
        let Some(interrupt) = self.interrupts.claim(interrupt_id).await? else {
            return Ok(());
        };

        let state = match self.apply_interrupt(&interrupt).await {
            Ok(true) => InterruptState::ProcessedSuccessfully,
            Ok(false) => InterruptState::ProcessedUnsuccessfully,
            Err(err) if err.is_transient() => {
                // Hand the claim back so the redelivered message can retry.
                self.interrupts
                    .finish(interrupt_id, InterruptState::Registered)
                    .await?;
                return Err(err);
            }
            Err(err) => {
                error!(
                    interrupt_id,
                    interrupt_type = %interrupt.interrupt_type,
                    error = %err,
                    "Interrupt failed"
                );
                InterruptState::ProcessedUnsuccessfully
            }
        };

        self.interrupts.finish(interrupt_id, state).await?;
        info!(
            interrupt_id,
            interrupt_type = %interrupt.interrupt_type,
            node_execution_id = ?interrupt.node_execution_id,
            state = %state,
            "Processed interrupt"
        );
        self.events
            .emit(&OrchestrationEvent::InterruptProcessed {
                interrupt_id: interrupt_id.to_string(),
                plan_execution_id: interrupt.plan_execution_id.clone(),
                interrupt_type: interrupt.interrupt_type.to_string(),
                state: state.to_string(),
            })
            .await;
        Ok(())
    }

    /// Applies an interrupt. `Ok(false)` means it had nothing to act on.
    async fn apply_interrupt(&self, interrupt: &Interrupt) -> Result<bool> {
        let plan_execution_id = interrupt.plan_execution_id.as_str();
        let target = interrupt.node_execution_id.as_deref().unwrap_or_default();

        match interrupt.interrupt_type {
            InterruptType::AbortAll => self.abort_all(plan_execution_id).await,
            InterruptType::PauseAll => self.pause_all(plan_execution_id).await,
            InterruptType::ResumeAll => self.resume_all(plan_execution_id).await,
            InterruptType::Abort => self.abort_node(target).await,
            InterruptType::Pause => self.pause_node(target).await,
            InterruptType::Resume => self.resume_node(target).await,
            InterruptType::Retry => self.create_retry(target).await,
            InterruptType::MarkExpired => {
                self.force_conclude(target, StepResponse::expired("Node deadline passed"))
                    .await
            }
            InterruptType::MarkSuccess => self.force_conclude(target, StepResponse::success()).await,
            InterruptType::MarkFailed => {
                self.force_conclude(
                    target,
                    StepResponse::failed("Marked failed by interrupt", FailureType::Application),
                )
                .await
            }
        }
    }

    async fn abort_all(&self, plan_execution_id: &str) -> Result<bool> {
        let updated = self
            .update_plan(plan_execution_id, |p| {
                if p.status != Status::Running {
                    return Ok(false);
                }
                p.status = Status::Discontinuing;
                Ok(true)
            })
            .await?;
        if updated.is_none() {
            return Ok(false);
        }

        let roots: Vec<NodeExecution> = self
            .nodes
            .fetch_by_plan_execution(plan_execution_id)
            .await?
            .into_iter()
            .filter(|n| n.parent_id.is_none() && n.is_pending())
            .collect();
        for root in roots {
            self.abort_node(&root.uuid).await?;
        }
        self.maybe_end_plan(plan_execution_id).await?;
        Ok(true)
    }

    /// Marks a node and its subtree discontinuing, then aborts the leaves.
    ///
    /// Leaves waiting on callbacks get the step's abort hook and a grace
    /// deadline to acknowledge; every other leaf is aborted at once. Parents
    /// converge once their children have.
    pub(crate) async fn abort_node(&self, node_execution_id: &str) -> Result<bool> {
        let node = self.require_node(node_execution_id).await?;
        if node.awaiting_retry {
            self.cancel_pending_retry(&node).await?;
            return Ok(true);
        }
        if node.status.is_terminal() {
            return Ok(false);
        }

        let mut subtree = vec![node];
        subtree.extend(self.nodes.fetch_descendants(node_execution_id, false).await?);

        let mut parents = Vec::new();
        let mut leaves = Vec::new();
        for member in subtree {
            if member.awaiting_retry {
                self.cancel_pending_retry(&member).await?;
                continue;
            }
            if member.status.is_terminal() {
                continue;
            }
            let marked = self
                .update_node(&member.uuid, |n| {
                    if n.status.is_terminal() || n.status == Status::Discontinuing {
                        return Ok(false);
                    }
                    apply_status(n, Status::Discontinuing)?;
                    n.pending_children.clear();
                    n.paused = false;
                    n.deferred_start = false;
                    n.buffered_responses = None;
                    Ok(true)
                })
                .await?;
            let Some(marked) = marked else { continue };
            if marked.is_parent() {
                parents.push(marked);
            } else {
                leaves.push(marked);
            }
        }

        for leaf in leaves.iter().rev() {
            self.abort_leaf(leaf).await?;
        }
        for parent in parents.iter().rev() {
            self.evaluate_parent(&parent.uuid).await?;
        }
        info!(node_execution_id, "Abort propagated");
        Ok(true)
    }

    async fn abort_leaf(&self, leaf: &NodeExecution) -> Result<()> {
        let awaiting_callbacks = leaf.is_waiting() && leaf.mode.is_some_and(|m| m.awaits_callbacks());
        if !awaiting_callbacks {
            return self.conclude(&leaf.uuid, StepResponse::aborted()).await;
        }

        self.call_abort_hook(leaf).await?;
        let timeout_id = self
            .timeouts
            .schedule_after(
                self.config.abort_grace_period_ms,
                TimeoutCallback::AbortGrace {
                    node_execution_id: leaf.uuid.clone(),
                },
            )
            .await?;
        self.update_node(&leaf.uuid, |n| {
            n.timeout_instance_ids.push(timeout_id.clone());
            Ok(true)
        })
        .await?;
        debug!(node_execution_id = %leaf.uuid, "Awaiting abort acknowledgement");
        Ok(())
    }

    async fn call_abort_hook(&self, node: &NodeExecution) -> Result<()> {
        let plan = self.plan_for(node.plan_execution_id()).await?;
        if let (Some(plan_node), Ok(step)) = (plan.node(&node.plan_node_id), self.registry.step(&node.step_type)) {
            step.handle_abort(&StepContext::new(node, plan_node)).await;
        }
        Ok(())
    }

    async fn cancel_pending_retry(&self, node: &NodeExecution) -> Result<()> {
        self.timeouts
            .cancel(&node.adviser_timeout_instance_ids)
            .await?;
        let cancelled = self
            .update_node(&node.uuid, |n| {
                if !n.awaiting_retry {
                    return Ok(false);
                }
                n.awaiting_retry = false;
                n.adviser_timeout_instance_ids.clear();
                Ok(true)
            })
            .await?;
        if cancelled.is_some() {
            debug!(node_execution_id = %node.uuid, "Cancelled pending retry");
            self.publish_concluded(&node.uuid).await?;
        }
        Ok(())
    }

    async fn pause_node(&self, node_execution_id: &str) -> Result<bool> {
        let paused = self
            .update_node(node_execution_id, |n| {
                if n.status.is_terminal() || n.status == Status::Discontinuing || n.paused {
                    return Ok(false);
                }
                n.paused = true;
                match n.status {
                    Status::Running => apply_status(n, Status::Suspended)?,
                    Status::Queued => n.deferred_start = true,
                    _ => {}
                }
                Ok(true)
            })
            .await?;
        let Some(node) = paused else {
            return Ok(false);
        };

        self.timeouts
            .on_event(&node.timeout_instance_ids, TimeoutEvent::Pause)
            .await?;
        debug!(node_execution_id, "Paused node");
        Ok(true)
    }

    /// Unpauses a node and replays whatever was held back while paused.
    async fn resume_node(&self, node_execution_id: &str) -> Result<bool> {
        let mut buffered = None;
        let resumed = self
            .update_node(node_execution_id, |n| {
                if !n.paused {
                    return Ok(false);
                }
                n.paused = false;
                if n.status == Status::Suspended && n.notify_id.is_none() {
                    apply_status(n, Status::Running)?;
                }
                buffered = n.buffered_responses.take();
                Ok(true)
            })
            .await?;
        let Some(node) = resumed else {
            return Ok(false);
        };

        self.timeouts
            .on_event(&node.timeout_instance_ids, TimeoutEvent::Resume)
            .await?;

        if node.status == Status::Queued && node.deferred_start {
            self.update_node(node_execution_id, |n| {
                n.deferred_start = false;
                Ok(true)
            })
            .await?;
            self.run_node(node_execution_id).await?;
        } else if let Some(responses) = buffered {
            self.apply_responses(node_execution_id, &responses).await?;
        } else if node.is_parent() {
            self.evaluate_parent(node_execution_id).await?;
        }
        debug!(node_execution_id, "Resumed node");
        Ok(true)
    }

    async fn pause_all(&self, plan_execution_id: &str) -> Result<bool> {
        let updated = self
            .update_plan(plan_execution_id, |p| {
                if p.paused || p.status.is_terminal() {
                    return Ok(false);
                }
                p.paused = true;
                Ok(true)
            })
            .await?;
        if updated.is_none() {
            return Ok(false);
        }

        for node in self.nodes.fetch_non_terminal(plan_execution_id).await? {
            self.pause_node(&node.uuid).await?;
        }
        Ok(true)
    }

    async fn resume_all(&self, plan_execution_id: &str) -> Result<bool> {
        let updated = self
            .update_plan(plan_execution_id, |p| {
                if !p.paused {
                    return Ok(false);
                }
                p.paused = false;
                Ok(true)
            })
            .await?;
        if updated.is_none() {
            return Ok(false);
        }

        // Children before parents.
        let nodes = self.nodes.fetch_non_terminal(plan_execution_id).await?;
        for node in nodes.iter().rev().filter(|n| n.paused) {
            self.resume_node(&node.uuid).await?;
        }
        Ok(true)
    }

    /// Concludes a node out of band with `response`.
    async fn force_conclude(&self, node_execution_id: &str, response: StepResponse) -> Result<bool> {
        let node = self.require_node(node_execution_id).await?;

        if node.status.is_terminal() {
            if response.status == Status::Succeeded && node.status.is_broken() {
                self.transition(node_execution_id, Status::Succeeded, |n, _| {
                    n.awaiting_retry = false;
                })
                .await?;
                self.timeouts
                    .cancel(&node.adviser_timeout_instance_ids)
                    .await?;
                if !node.old_retry {
                    self.publish_concluded(node_execution_id).await?;
                }
                return Ok(true);
            }
            return Ok(false);
        }
        if node.status == Status::Discontinuing {
            return Ok(false);
        }

        if node.is_parent() {
            for child in self.nodes.fetch_children(node_execution_id, false).await? {
                self.abort_node(&child.uuid).await?;
            }
        }
        if let Some(notify_id) = &node.notify_id {
            self.waiter.cancel_wait(notify_id).await?;
            self.call_abort_hook(&node).await?;
        }
        if node.status == Status::Queued && !node.status.can_transition_to(response.status) {
            self.transition(node_execution_id, Status::Running, |n, _| {
                n.deferred_start = false;
            })
            .await?;
        }
        self.conclude(node_execution_id, response).await?;
        Ok(true)
    }
}
