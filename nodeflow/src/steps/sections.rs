//! Structural steps: sections with one child and forks with many.

use async_trait::async_trait;
use serde::Deserialize;

use super::{Step, StepContext};
use crate::core::{ChildrenExecutableResponse, Executable, ExecutionMode};
use crate::errors::StepError;

/// Descends into the child named by the `child_node_id` parameter.
///
/// Used for pipelines, stages and step groups that run a chain of steps.
#[derive(Debug, Clone)]
pub struct SectionStep {
    step_type: String,
}

impl SectionStep {
    /// Creates a section step.
    #[must_use]
    pub fn new(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
        }
    }
}

#[async_trait]
impl Step for SectionStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Executable, StepError> {
        if ctx.mode != Some(ExecutionMode::Child) {
            return Err(StepError::unsupported(
                &self.step_type,
                ctx.mode.map_or_else(|| "none".to_string(), |m| m.to_string()),
            ));
        }
        let child_node_id = ctx
            .param_str("child_node_id")
            .ok_or_else(|| anyhow::anyhow!("Section '{}' has no child_node_id", ctx.plan_node.uuid))?;
        Ok(Executable::Child {
            child_node_id: child_node_id.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ForkParameters {
    children: Vec<String>,
    #[serde(default)]
    max_concurrency: Option<usize>,
}

/// Runs the `children` parameter in parallel, bounded by `max_concurrency`.
#[derive(Debug, Clone)]
pub struct ForkStep {
    step_type: String,
}

impl ForkStep {
    /// Creates a fork step.
    #[must_use]
    pub fn new(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
        }
    }
}

#[async_trait]
impl Step for ForkStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Executable, StepError> {
        if ctx.mode != Some(ExecutionMode::Children) {
            return Err(StepError::unsupported(
                &self.step_type,
                ctx.mode.map_or_else(|| "none".to_string(), |m| m.to_string()),
            ));
        }
        let params: ForkParameters =
            serde_json::from_value(ctx.parameters.clone()).map_err(anyhow::Error::from)?;
        Ok(Executable::Children(ChildrenExecutableResponse {
            child_node_ids: params.children,
            max_concurrency: params.max_concurrency,
        }))
    }
}
