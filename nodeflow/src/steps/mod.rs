//! Step plugins.
//!
//! The engine is agnostic to what a step does. It only asks a step how it
//! wants to run, hands it callback responses and child outcomes, and tells
//! it when it is being aborted.

mod resource_constraint;
mod sections;

pub use resource_constraint::{ResourceConstraintParameters, ResourceConstraintStep};
pub use sections::{ForkStep, SectionStep};

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;

use crate::core::{
    worst_status, Ambiance, ChildOutcome, Executable, ExecutionMode, FailureInfo, FailureType,
    NodeExecution, PlanNode, ResponseData, Status, StepResponse,
};
use crate::errors::StepError;
use crate::facilitator::FacilitatorResponse;

/// Everything a step sees about the node it runs for.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Node execution id.
    pub node_execution_id: String,
    /// Position in the plan execution.
    pub ambiance: Ambiance,
    /// The plan node.
    pub plan_node: PlanNode,
    /// Step parameters for this attempt.
    pub parameters: serde_json::Value,
    /// Mode chosen by facilitation, once known.
    pub mode: Option<ExecutionMode>,
    /// Retry attempt index.
    pub retry_index: u32,
}

impl StepContext {
    /// Builds a context for `node`.
    #[must_use]
    pub fn new(node: &NodeExecution, plan_node: &PlanNode) -> Self {
        Self {
            node_execution_id: node.uuid.clone(),
            ambiance: node.ambiance.clone(),
            plan_node: plan_node.clone(),
            parameters: node.step_parameters.clone(),
            mode: node.mode,
            retry_index: node.retry_index(),
        }
    }

    /// Sets the execution mode.
    #[must_use]
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// The plan execution id.
    #[must_use]
    pub fn plan_execution_id(&self) -> &str {
        &self.ambiance.plan_execution_id
    }

    /// Reads a string parameter.
    #[must_use]
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(serde_json::Value::as_str)
    }
}

/// A step plugin, registered by step type.
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// The step type this plugin handles.
    fn step_type(&self) -> &str;

    /// Overrides the plan's facilitator. `None` defers to the plan.
    async fn facilitate(&self, _ctx: &StepContext) -> Option<FacilitatorResponse> {
        None
    }

    /// Starts the step in `ctx.mode`.
    async fn execute(&self, ctx: &StepContext) -> Result<Executable, StepError>;

    /// Builds the final response once every callback has been notified.
    ///
    /// The default reads each response as a [`StepResponse`] and reduces
    /// their statuses; opaque payloads count as success and are kept as
    /// outputs keyed by correlation id.
    async fn handle_async_response(
        &self,
        _ctx: &StepContext,
        responses: &HashMap<String, ResponseData>,
    ) -> StepResponse {
        let mut statuses = Vec::with_capacity(responses.len());
        let mut failure_info = None;
        let mut outputs = HashMap::new();

        for (correlation_id, data) in responses {
            match serde_json::from_value::<StepResponse>(data.clone()) {
                Ok(resp) => {
                    statuses.push(resp.status);
                    if failure_info.is_none() {
                        failure_info = resp.failure_info;
                    }
                    outputs.extend(resp.outputs);
                }
                Err(_) => {
                    statuses.push(Status::Succeeded);
                    outputs.insert(correlation_id.clone(), data.clone());
                }
            }
        }

        let status = worst_status(statuses);
        StepResponse {
            status,
            failure_info: if status.is_broken() { failure_info } else { None },
            outputs,
        }
    }

    /// Builds the final response once every child is terminal.
    ///
    /// The default is the worst-status-wins reduction.
    async fn handle_children_response(
        &self,
        _ctx: &StepContext,
        children: &[ChildOutcome],
    ) -> StepResponse {
        let status = worst_status(children.iter().map(|c| c.status));
        let mut resp = StepResponse::new(status);
        if status.is_broken() {
            let failed: Vec<&str> = children
                .iter()
                .filter(|c| c.status.is_broken())
                .map(|c| c.plan_node_id.as_str())
                .collect();
            resp = resp.with_failure(FailureInfo::new(
                format!("Children failed: {}", failed.join(", ")),
                FailureType::Application,
            ));
        }
        resp
    }

    /// Called when the node is aborted or expires while work is in flight.
    async fn handle_abort(&self, _ctx: &StepContext) {}
}

/// A sync step backed by a closure.
pub struct FnStep<F>
where
    F: Fn(&StepContext) -> StepResponse + Send + Sync,
{
    step_type: String,
    func: F,
}

impl<F> FnStep<F>
where
    F: Fn(&StepContext) -> StepResponse + Send + Sync,
{
    /// Creates a closure step.
    pub fn new(step_type: impl Into<String>, func: F) -> Self {
        Self {
            step_type: step_type.into(),
            func,
        }
    }
}

impl<F> Debug for FnStep<F>
where
    F: Fn(&StepContext) -> StepResponse + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStep")
            .field("step_type", &self.step_type)
            .finish()
    }
}

#[async_trait]
impl<F> Step for FnStep<F>
where
    F: Fn(&StepContext) -> StepResponse + Send + Sync,
{
    fn step_type(&self) -> &str {
        &self.step_type
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Executable, StepError> {
        match ctx.mode {
            Some(ExecutionMode::Sync) | None => Ok(Executable::Sync((self.func)(ctx))),
            Some(mode) => Err(StepError::unsupported(&self.step_type, mode)),
        }
    }
}

/// A sync step that always succeeds.
#[derive(Debug, Clone)]
pub struct NoOpStep {
    step_type: String,
}

impl NoOpStep {
    /// Creates a no-op step.
    #[must_use]
    pub fn new(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
        }
    }
}

#[async_trait]
impl Step for NoOpStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    async fn execute(&self, _ctx: &StepContext) -> Result<Executable, StepError> {
        Ok(Executable::Sync(StepResponse::success()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Level;
    use chrono::Utc;

    fn ctx() -> StepContext {
        let plan_node = PlanNode::new("a", "Shell");
        let ambiance = Ambiance::new("pe1", "p1")
            .clone_for_child(Level::for_node("rt-a", &plan_node, 0, Utc::now()));
        let node = NodeExecution::new(ambiance, Utc::now())
            .with_parameters(serde_json::json!({"script": "make"}));
        StepContext::new(&node, &plan_node).with_mode(ExecutionMode::Sync)
    }

    #[tokio::test]
    async fn test_fn_step_runs_closure() {
        let step = FnStep::new("Shell", |ctx: &StepContext| {
            StepResponse::success().with_output("script", serde_json::json!(ctx.param_str("script")))
        });

        let exec = step.execute(&ctx()).await.unwrap();
        match exec {
            Executable::Sync(resp) => assert_eq!(resp.outputs["script"], "make"),
            other => panic!("unexpected executable: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fn_step_rejects_other_modes() {
        let step = FnStep::new("Shell", |_: &StepContext| StepResponse::success());
        let err = step
            .execute(&ctx().with_mode(ExecutionMode::Async))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_default_async_response_reduction() {
        let step = NoOpStep::new("Shell");
        let mut responses = HashMap::new();
        responses.insert("c1".to_string(), serde_json::json!({"status": "succeeded"}));
        responses.insert(
            "c2".to_string(),
            serde_json::to_value(StepResponse::failed("exit 2", FailureType::Application)).unwrap(),
        );

        let resp = step.handle_async_response(&ctx(), &responses).await;
        assert_eq!(resp.status, Status::Failed);
        assert_eq!(resp.failure_info.unwrap().message, "exit 2");
    }

    #[tokio::test]
    async fn test_default_async_response_opaque_payload() {
        let step = NoOpStep::new("Shell");
        let mut responses = HashMap::new();
        responses.insert("c1".to_string(), serde_json::json!({"approved": true}));

        let resp = step.handle_async_response(&ctx(), &responses).await;
        assert_eq!(resp.status, Status::Succeeded);
        assert_eq!(resp.outputs["c1"]["approved"], true);
    }

    #[tokio::test]
    async fn test_default_children_response() {
        let step = NoOpStep::new("Fork");
        let outcome = |id: &str, status| ChildOutcome {
            node_execution_id: format!("rt-{id}"),
            plan_node_id: id.to_string(),
            status,
            failure_info: None,
        };

        let resp = step
            .handle_children_response(
                &ctx(),
                &[
                    outcome("a", Status::Succeeded),
                    outcome("b", Status::Failed),
                    outcome("c", Status::Skipped),
                ],
            )
            .await;
        assert_eq!(resp.status, Status::Failed);
        assert!(resp.failure_info.unwrap().message.contains('b'));

        let resp = step.handle_children_response(&ctx(), &[]).await;
        assert_eq!(resp.status, Status::Succeeded);
    }
}
