//! A step that waits for a resource restraint slot.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::{Step, StepContext};
use crate::core::{AsyncExecutableResponse, Executable, ExecutionMode, ResponseData, StepResponse};
use crate::errors::StepError;
use crate::facilitator::FacilitatorResponse;
use crate::restraint::{AcquireRequest, HoldingScope, ResourceRestraintService};

/// Parameters of a resource constraint step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConstraintParameters {
    /// Restraint to acquire.
    pub restraint_id: String,
    /// Unit within the restraint.
    pub resource_unit: String,
    /// How long the slot is held.
    #[serde(default)]
    pub holding_scope: HoldingScope,
    /// Explicit queue position.
    #[serde(default)]
    pub order: Option<u64>,
}

/// Acquires a slot and suspends until it is granted.
///
/// Always runs async: the grant arrives as a notify on the step's callback
/// id, either straight away or when an earlier holder releases.
#[derive(Debug, Clone)]
pub struct ResourceConstraintStep {
    step_type: String,
    restraints: Arc<ResourceRestraintService>,
}

impl ResourceConstraintStep {
    /// Registered step type.
    pub const STEP_TYPE: &'static str = "ResourceConstraint";

    /// Creates the step.
    #[must_use]
    pub fn new(restraints: Arc<ResourceRestraintService>) -> Self {
        Self {
            step_type: Self::STEP_TYPE.to_string(),
            restraints,
        }
    }

    fn callback_id(ctx: &StepContext) -> String {
        format!("restraint:{}", ctx.node_execution_id)
    }
}

#[async_trait]
impl Step for ResourceConstraintStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    async fn facilitate(&self, _ctx: &StepContext) -> Option<FacilitatorResponse> {
        Some(FacilitatorResponse::new(ExecutionMode::Async))
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Executable, StepError> {
        let params: ResourceConstraintParameters = serde_json::from_value(ctx.parameters.clone())
            .map_err(|e| StepError::dispatch(format!("Invalid resource constraint parameters: {e}")))?;
        let release_entity_id = params
            .holding_scope
            .release_entity_id(&ctx.ambiance)
            .ok_or_else(|| {
                StepError::dispatch(format!(
                    "No {:?} level to hold resource '{}'",
                    params.holding_scope, params.resource_unit
                ))
            })?;

        let callback_id = Self::callback_id(ctx);
        self.restraints
            .acquire(AcquireRequest {
                restraint_id: params.restraint_id,
                resource_unit: params.resource_unit,
                release_entity_id,
                holding_scope: params.holding_scope,
                order: params.order,
                node_execution_id: ctx.node_execution_id.clone(),
                plan_execution_id: ctx.plan_execution_id().to_string(),
                callback_id: Some(callback_id.clone()),
            })
            .await
            .map_err(|e| StepError::dispatch(e.to_string()))?;

        Ok(Executable::Async(AsyncExecutableResponse::new([callback_id])))
    }

    async fn handle_async_response(
        &self,
        ctx: &StepContext,
        responses: &HashMap<String, ResponseData>,
    ) -> StepResponse {
        let mut resp = StepResponse::success();
        if let Some(grant) = responses.get(&Self::callback_id(ctx)) {
            if let Some(id) = grant.get("restraint_instance_id") {
                resp = resp.with_output("restraint_instance_id", id.clone());
            }
        }
        resp
    }
}
