//! Facilitators decide how a node runs before it is dispatched.
//!
//! The plan names a [`FacilitatorType`]; the registry resolves it to a
//! [`Facilitator`], which returns the [`ExecutionMode`] the node will use.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::{Ambiance, ExecutionMode, PlanNode};
use crate::errors::StepError;

/// Facilitator kinds. Built-in kinds map one-to-one to execution modes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacilitatorType {
    /// Sync execution.
    Sync,
    /// Async execution.
    Async,
    /// Task execution.
    Task,
    /// Single child.
    Child,
    /// Multiple children.
    Children,
    /// A facilitator registered by name.
    Custom(String),
}

impl fmt::Display for FacilitatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Async => write!(f, "async"),
            Self::Task => write!(f, "task"),
            Self::Child => write!(f, "child"),
            Self::Children => write!(f, "children"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

impl FacilitatorType {
    /// The execution mode of a built-in facilitator type.
    #[must_use]
    pub fn builtin_mode(&self) -> Option<ExecutionMode> {
        match self {
            Self::Sync => Some(ExecutionMode::Sync),
            Self::Async => Some(ExecutionMode::Async),
            Self::Task => Some(ExecutionMode::Task),
            Self::Child => Some(ExecutionMode::Child),
            Self::Children => Some(ExecutionMode::Children),
            Self::Custom(_) => None,
        }
    }
}

/// How a plan node obtains its facilitator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilitatorObtainment {
    /// The facilitator kind.
    pub facilitator_type: FacilitatorType,
    /// Facilitator parameters.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl FacilitatorObtainment {
    /// Creates an obtainment without parameters.
    #[must_use]
    pub fn new(facilitator_type: FacilitatorType) -> Self {
        Self {
            facilitator_type,
            parameters: serde_json::Value::Null,
        }
    }
}

/// The facilitation decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilitatorResponse {
    /// The execution mode to dispatch with.
    pub execution_mode: ExecutionMode,
}

impl FacilitatorResponse {
    /// Creates a response for `execution_mode`.
    #[must_use]
    pub fn new(execution_mode: ExecutionMode) -> Self {
        Self { execution_mode }
    }
}

/// Decides the execution mode of a node.
#[async_trait]
pub trait Facilitator: Send + Sync {
    /// Facilitates `node` at `ambiance` with `parameters`.
    async fn facilitate(
        &self,
        ambiance: &Ambiance,
        node: &PlanNode,
        parameters: &serde_json::Value,
    ) -> Result<FacilitatorResponse, StepError>;
}

/// A facilitator that always returns the same mode.
#[derive(Debug, Clone, Copy)]
pub struct ModeFacilitator {
    mode: ExecutionMode,
}

impl ModeFacilitator {
    /// Creates a facilitator for `mode`.
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        Self { mode }
    }
}

#[async_trait]
impl Facilitator for ModeFacilitator {
    async fn facilitate(
        &self,
        _ambiance: &Ambiance,
        _node: &PlanNode,
        _parameters: &serde_json::Value,
    ) -> Result<FacilitatorResponse, StepError> {
        Ok(FacilitatorResponse::new(self.mode))
    }
}
