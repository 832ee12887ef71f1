//! Node start: creation, skip and facilitation, then dispatch by mode.

use tracing::{debug, info, warn};

use std::sync::Arc;

use super::transitions::apply_status;
use super::Engine;
use crate::core::{
    Executable, ExecutionMode, FailureType, Level, NodeExecution, Plan, PlanNode, SkipCondition,
    Status, StepResponse,
};
use crate::errors::{EngineError, Result, StepError};
use crate::events::{EngineMessage, StartNodeRequest};
use crate::steps::StepContext;
use crate::utils::{derive_id, generate_id};

/// Maps a step failure to the response the node concludes with.
pub(crate) fn step_error_response(err: StepError) -> StepResponse {
    match err {
        StepError::Dispatch(message) => StepResponse::failed(message, FailureType::Dispatch),
        err @ StepError::Unsupported { .. } => StepResponse::errored(err.to_string()),
        StepError::Other(err) => StepResponse::failed(err.to_string(), FailureType::Application),
    }
}

/// The start request for a child of `parent`.
///
/// Child ids are derived from the parent and the child plan node, so a
/// repeated start of the same child resolves to the same record.
pub(crate) fn child_request(parent: &NodeExecution, plan_node_id: &str) -> StartNodeRequest {
    StartNodeRequest {
        node_execution_id: derive_id(&[&parent.uuid, "child", plan_node_id]),
        plan_node_id: plan_node_id.to_string(),
        ambiance: parent.ambiance.clone(),
        parent_id: Some(parent.uuid.clone()),
        previous_id: None,
        retry_index: 0,
        retry_ids: Vec::new(),
    }
}

enum Gate {
    Run,
    Abort,
    Defer,
}

impl Engine {
    pub(crate) async fn plan_for(&self, plan_execution_id: &str) -> Result<Arc<Plan>> {
        self.plans
            .get_plan(plan_execution_id)
            .await?
            .ok_or_else(|| EngineError::not_found("plan", plan_execution_id))
    }

    /// Creates the queued record for `request` and publishes its start.
    ///
    /// The record exists before the message does, so a parent evaluating
    /// its children never misses one that is about to start.
    pub(crate) async fn enqueue_start(&self, request: StartNodeRequest) -> Result<()> {
        self.create_node(&request).await?;
        EngineMessage::StartNode(request)
            .publish(self.bus.as_ref())
            .await?;
        Ok(())
    }

    /// Inserts the queued record for `request`. Returns `None` if it
    /// already exists.
    pub(crate) async fn create_node(&self, request: &StartNodeRequest) -> Result<Option<NodeExecution>> {
        let plan = self.plan_for(&request.ambiance.plan_execution_id).await?;
        let plan_node = plan
            .node(&request.plan_node_id)
            .ok_or_else(|| EngineError::not_found("plan node", &request.plan_node_id))?;

        let now = self.clock.now();
        let level = Level::for_node(&request.node_execution_id, plan_node, request.retry_index, now);
        let node = NodeExecution::new(request.ambiance.clone_for_child(level), now)
            .with_parent(request.parent_id.clone())
            .with_previous(request.previous_id.clone())
            .with_retry_ids(request.retry_ids.clone())
            .with_parameters(plan_node.step_parameters.clone());

        if !self.nodes.insert(node.clone()).await? {
            debug!(node_execution_id = %node.uuid, "Node execution already exists");
            return Ok(None);
        }
        self.emit_node_status(&node, None).await;
        Ok(Some(node))
    }

    pub(crate) async fn handle_start(&self, request: StartNodeRequest) -> Result<()> {
        let node = match self.nodes.get(&request.node_execution_id).await? {
            Some(node) => node,
            None => {
                self.create_node(&request).await?;
                self.require_node(&request.node_execution_id).await?
            }
        };

        if node.status != Status::Queued || node.deferred_start {
            debug!(
                node_execution_id = %node.uuid,
                status = %node.status,
                "Start already handled"
            );
            return Ok(());
        }
        self.run_node(&node.uuid).await
    }

    async fn gate(&self, node: &NodeExecution) -> Result<Gate> {
        let execution = self.require_plan_execution(node.plan_execution_id()).await?;
        if execution.status != Status::Running {
            return Ok(Gate::Abort);
        }
        if let Some(parent_id) = &node.parent_id {
            if let Some(parent) = self.nodes.get(parent_id).await? {
                if parent.status == Status::Discontinuing || parent.status.is_terminal() {
                    return Ok(Gate::Abort);
                }
            }
        }
        if execution.paused || node.paused {
            return Ok(Gate::Defer);
        }
        Ok(Gate::Run)
    }

    /// Runs a queued node: skip check, facilitation, then dispatch.
    pub(crate) async fn run_node(&self, node_execution_id: &str) -> Result<()> {
        let node = self.require_node(node_execution_id).await?;
        if node.status != Status::Queued {
            return Ok(());
        }

        match self.gate(&node).await? {
            Gate::Run => {}
            Gate::Abort => {
                info!(node_execution_id, "Aborting node started under an abort");
                return self.conclude(node_execution_id, StepResponse::aborted()).await;
            }
            Gate::Defer => {
                debug!(node_execution_id, "Deferring start while paused");
                self.update_node(node_execution_id, |n| {
                    n.paused = true;
                    n.deferred_start = true;
                    Ok(true)
                })
                .await?;
                return Ok(());
            }
        }

        let plan = self.plan_for(node.plan_execution_id()).await?;
        let plan_node = plan
            .node(&node.plan_node_id)
            .ok_or_else(|| EngineError::not_found("plan node", &node.plan_node_id))?;

        if let Some(response) = self.pre_dispatch_response(&node, plan_node).await? {
            return self.conclude(node_execution_id, response).await;
        }

        let step = match self.registry.step(&plan_node.step_type) {
            Ok(step) => step,
            Err(err) => {
                return self
                    .conclude(node_execution_id, StepResponse::errored(err.to_string()))
                    .await;
            }
        };

        let ctx = StepContext::new(&node, plan_node);
        let mode = match step.facilitate(&ctx).await {
            Some(response) => response.execution_mode,
            None => match self.facilitate(&node, plan_node).await {
                Ok(mode) => mode,
                Err(response) => return self.conclude(node_execution_id, response).await,
            },
        };

        let now = self.clock.now();
        let Some((node, _)) = self
            .transition(node_execution_id, Status::Running, |n, _| {
                n.mode = Some(mode);
                n.start_ts = Some(now);
                n.deferred_start = false;
            })
            .await?
        else {
            return Ok(());
        };

        let timeout_ids = self
            .timeouts
            .schedule_node_timeouts(&node.uuid, &plan_node.timeout_obtainments)
            .await?;
        if !timeout_ids.is_empty() {
            self.update_node(node_execution_id, |n| {
                n.timeout_instance_ids.extend(timeout_ids.iter().cloned());
                Ok(true)
            })
            .await?;
        }

        info!(
            node_execution_id,
            plan_node_id = %node.plan_node_id,
            step_type = %node.step_type,
            mode = %mode,
            "Dispatching node"
        );
        let ctx = ctx.with_mode(mode);
        let executable = match step.execute(&ctx).await {
            Ok(executable) => executable,
            Err(err) => return self.conclude(node_execution_id, step_error_response(err)).await,
        };
        if !executable.matches_mode(mode) {
            let err = StepError::unsupported(&node.step_type, mode);
            return self.conclude(node_execution_id, step_error_response(err)).await;
        }

        match executable {
            Executable::Sync(response) => self.conclude(node_execution_id, response).await,
            Executable::Async(response) => {
                self.suspend_on_callbacks(&node, response.callback_ids)
                    .await
            }
            Executable::Child { child_node_id } => {
                self.start_children(node_execution_id, vec![child_node_id], None)
                    .await
            }
            Executable::Children(response) => {
                self.start_children(
                    node_execution_id,
                    response.child_node_ids,
                    response.max_concurrency,
                )
                .await
            }
        }
    }

    /// Skip conditions and rollback targeting, checked before facilitation.
    async fn pre_dispatch_response(
        &self,
        node: &NodeExecution,
        plan_node: &PlanNode,
    ) -> Result<Option<StepResponse>> {
        match &plan_node.skip_condition {
            Some(SkipCondition::Always) => return Ok(Some(StepResponse::skipped())),
            Some(SkipCondition::Expression(expression)) => {
                match self
                    .registry
                    .condition_evaluator()
                    .evaluate(expression, &node.ambiance)
                {
                    Ok(true) => return Ok(Some(StepResponse::skipped())),
                    Ok(false) => {}
                    Err(message) => return Ok(Some(StepResponse::errored(message))),
                }
            }
            None => {}
        }

        if let Some(target) = &plan_node.rollback_target {
            let execution = self.require_plan_execution(node.plan_execution_id()).await?;
            if !execution.rollback_includes(target) {
                debug!(
                    node_execution_id = %node.uuid,
                    rollback_target = %target,
                    "Skipping rollback of a node that did not fail"
                );
                return Ok(Some(StepResponse::skipped()));
            }
        }
        Ok(None)
    }

    async fn facilitate(&self, node: &NodeExecution, plan_node: &PlanNode) -> Result<ExecutionMode, StepResponse> {
        let obtainment = &plan_node.facilitator_obtainment;
        let facilitator = self
            .registry
            .facilitator(&obtainment.facilitator_type)
            .map_err(|err| StepResponse::errored(err.to_string()))?;

        facilitator
            .facilitate(&node.ambiance, plan_node, &obtainment.parameters)
            .await
            .map(|response| response.execution_mode)
            // Still queued here, and a queued node cannot move to failed.
            .map_err(|err| StepResponse::errored(err.to_string()))
    }

    async fn suspend_on_callbacks(&self, node: &NodeExecution, callback_ids: Vec<String>) -> Result<()> {
        if callback_ids.is_empty() {
            return self
                .conclude(
                    &node.uuid,
                    StepResponse::errored("Async step returned no callback ids"),
                )
                .await;
        }

        let notify_id = generate_id();
        let suspended = self
            .update_node(&node.uuid, |n| {
                if n.status.is_terminal() {
                    return Ok(false);
                }
                n.notify_id = Some(notify_id.clone());
                if n.status == Status::Running {
                    apply_status(n, Status::Suspended)?;
                }
                Ok(true)
            })
            .await?;
        if suspended.is_none() {
            warn!(node_execution_id = %node.uuid, "Node concluded before its wait was registered");
            return Ok(());
        }

        self.waiter
            .register_wait(&notify_id, &node.uuid, node.plan_execution_id(), callback_ids)
            .await?;
        Ok(())
    }

    /// Starts up to `max_concurrency` children and parks the rest.
    pub(crate) async fn start_children(
        &self,
        parent_id: &str,
        child_node_ids: Vec<String>,
        max_concurrency: Option<usize>,
    ) -> Result<()> {
        if child_node_ids.is_empty() {
            let parent = self.require_node(parent_id).await?;
            return self.conclude_parent(&parent, &[]).await;
        }

        let limit = max_concurrency.map_or(child_node_ids.len(), |m| m.max(1));
        let split = limit.min(child_node_ids.len());
        let (now, later) = child_node_ids.split_at(split);

        let Some(parent) = self
            .update_node(parent_id, |n| {
                n.pending_children = later.iter().cloned().collect();
                n.max_concurrency = max_concurrency;
                Ok(true)
            })
            .await?
        else {
            return Ok(());
        };

        let requests: Vec<StartNodeRequest> = now.iter().map(|id| child_request(&parent, id)).collect();
        for request in &requests {
            self.create_node(request).await?;
        }
        for request in requests {
            EngineMessage::StartNode(request)
                .publish(self.bus.as_ref())
                .await?;
        }

        debug!(
            parent_id,
            started = split,
            pending = later.len(),
            "Started children"
        );
        Ok(())
    }
}
