//! The plugin registry injected into the engine.
//!
//! Step types, facilitators and custom advisers are looked up by their
//! discriminator. There is no process-wide state: each engine owns its
//! registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::advise::Adviser;
use crate::core::{Ambiance, ExecutionMode};
use crate::errors::EngineError;
use crate::facilitator::{Facilitator, FacilitatorType, ModeFacilitator};
use crate::steps::Step;

/// Evaluates skip-condition expressions.
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluates `expression` at `ambiance`.
    ///
    /// # Errors
    ///
    /// Returns a message if the expression cannot be evaluated.
    fn evaluate(&self, expression: &str, ambiance: &Ambiance) -> Result<bool, String>;
}

/// Accepts the literals `true` and `false`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiteralConditionEvaluator;

impl ConditionEvaluator for LiteralConditionEvaluator {
    fn evaluate(&self, expression: &str, _ambiance: &Ambiance) -> Result<bool, String> {
        match expression.trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(format!("Cannot evaluate skip condition '{other}'")),
        }
    }
}

/// Lookup tables for step, facilitator and adviser plugins.
pub struct Registry {
    steps: HashMap<String, Arc<dyn Step>>,
    facilitators: HashMap<FacilitatorType, Arc<dyn Facilitator>>,
    advisers: HashMap<String, Arc<dyn Adviser>>,
    condition_evaluator: Arc<dyn ConditionEvaluator>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut facilitators: HashMap<FacilitatorType, Arc<dyn Facilitator>> = HashMap::new();
        for (kind, mode) in [
            (FacilitatorType::Sync, ExecutionMode::Sync),
            (FacilitatorType::Async, ExecutionMode::Async),
            (FacilitatorType::Task, ExecutionMode::Task),
            (FacilitatorType::Child, ExecutionMode::Child),
            (FacilitatorType::Children, ExecutionMode::Children),
        ] {
            facilitators.insert(kind, Arc::new(ModeFacilitator::new(mode)));
        }

        Self {
            steps: HashMap::new(),
            facilitators,
            advisers: HashMap::new(),
            condition_evaluator: Arc::new(LiteralConditionEvaluator),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut steps: Vec<&String> = self.steps.keys().collect();
        steps.sort();
        f.debug_struct("Registry")
            .field("steps", &steps)
            .field("facilitators", &self.facilitators.len())
            .field("advisers", &self.advisers.len())
            .finish()
    }
}

impl Registry {
    /// Creates a registry with the built-in facilitators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a step under its step type.
    #[must_use]
    pub fn with_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.insert(step.step_type().to_string(), step);
        self
    }

    /// Registers or replaces a facilitator.
    #[must_use]
    pub fn with_facilitator(
        mut self,
        facilitator_type: FacilitatorType,
        facilitator: Arc<dyn Facilitator>,
    ) -> Self {
        self.facilitators.insert(facilitator_type, facilitator);
        self
    }

    /// Registers a custom adviser.
    #[must_use]
    pub fn with_adviser(mut self, adviser_type: impl Into<String>, adviser: Arc<dyn Adviser>) -> Self {
        self.advisers.insert(adviser_type.into(), adviser);
        self
    }

    /// Replaces the skip-condition evaluator.
    #[must_use]
    pub fn with_condition_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.condition_evaluator = evaluator;
        self
    }

    /// Looks up a step.
    pub fn step(&self, step_type: &str) -> Result<Arc<dyn Step>, EngineError> {
        self.steps
            .get(step_type)
            .cloned()
            .ok_or_else(|| EngineError::NotRegistered(format!("step type '{step_type}'")))
    }

    /// Looks up a facilitator.
    pub fn facilitator(
        &self,
        facilitator_type: &FacilitatorType,
    ) -> Result<Arc<dyn Facilitator>, EngineError> {
        self.facilitators
            .get(facilitator_type)
            .cloned()
            .ok_or_else(|| EngineError::NotRegistered(format!("facilitator '{facilitator_type}'")))
    }

    /// Looks up a custom adviser.
    pub fn adviser(&self, adviser_type: &str) -> Result<Arc<dyn Adviser>, EngineError> {
        self.advisers
            .get(adviser_type)
            .cloned()
            .ok_or_else(|| EngineError::NotRegistered(format!("adviser '{adviser_type}'")))
    }

    /// The skip-condition evaluator.
    #[must_use]
    pub fn condition_evaluator(&self) -> &dyn ConditionEvaluator {
        self.condition_evaluator.as_ref()
    }

    /// Returns true if `step_type` is registered.
    #[must_use]
    pub fn has_step(&self, step_type: &str) -> bool {
        self.steps.contains_key(step_type)
    }
}
