//! Mock steps for testing.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::{
    AsyncExecutableResponse, Executable, ExecutionMode, FailureType, ResponseData, StepResponse,
};
use crate::errors::StepError;
use crate::facilitator::FacilitatorResponse;
use crate::steps::{Step, StepContext};

/// A sync step that records calls and returns a configurable response.
#[derive(Debug)]
pub struct MockStep {
    step_type: String,
    response: Mutex<StepResponse>,
    call_count: Mutex<usize>,
    node_ids: Mutex<Vec<String>>,
}

impl MockStep {
    /// Creates a mock step that succeeds.
    #[must_use]
    pub fn new(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            response: Mutex::new(StepResponse::success()),
            call_count: Mutex::new(0),
            node_ids: Mutex::new(Vec::new()),
        }
    }

    /// Creates a mock step returning `response`.
    #[must_use]
    pub fn with_response(step_type: impl Into<String>, response: StepResponse) -> Self {
        let step = Self::new(step_type);
        step.set_response(response);
        step
    }

    /// Sets the response to return.
    pub fn set_response(&self, response: StepResponse) {
        *self.response.lock() = response;
    }

    /// Returns the number of times the step was executed.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.call_count.lock()
    }

    /// Returns the node execution ids the step ran for, in order.
    #[must_use]
    pub fn recorded_nodes(&self) -> Vec<String> {
        self.node_ids.lock().clone()
    }

    /// Resets call tracking.
    pub fn reset(&self) {
        *self.call_count.lock() = 0;
        self.node_ids.lock().clear();
    }
}

#[async_trait]
impl Step for MockStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Executable, StepError> {
        *self.call_count.lock() += 1;
        self.node_ids.lock().push(ctx.node_execution_id.clone());
        Ok(Executable::Sync(self.response.lock().clone()))
    }
}

/// A sync step that fails, optionally only for its first attempts.
#[derive(Debug)]
pub struct FailingStep {
    step_type: String,
    message: String,
    failing_attempts: Option<u32>,
    dispatch: bool,
    call_count: Mutex<usize>,
}

impl FailingStep {
    /// Creates a step that always fails.
    #[must_use]
    pub fn new(step_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            message: message.into(),
            failing_attempts: None,
            dispatch: false,
            call_count: Mutex::new(0),
        }
    }

    /// Creates a step that fails its first `attempts` attempts, then succeeds.
    #[must_use]
    pub fn failing_first(step_type: impl Into<String>, attempts: u32) -> Self {
        Self {
            failing_attempts: Some(attempts),
            ..Self::new(step_type, "transient failure")
        }
    }

    /// Creates a step whose dispatch itself fails.
    #[must_use]
    pub fn dispatch(step_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            dispatch: true,
            ..Self::new(step_type, message)
        }
    }

    /// Returns the number of times the step was executed.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.call_count.lock()
    }
}

#[async_trait]
impl Step for FailingStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Executable, StepError> {
        *self.call_count.lock() += 1;
        if self.dispatch {
            return Err(StepError::dispatch(self.message.clone()));
        }
        let recovered = self
            .failing_attempts
            .is_some_and(|attempts| ctx.retry_index >= attempts);
        if recovered {
            Ok(Executable::Sync(StepResponse::success()))
        } else {
            Ok(Executable::Sync(StepResponse::failed(
                &self.message,
                FailureType::Application,
            )))
        }
    }
}

/// An async step that waits on callbacks and records abort requests.
///
/// Callback ids come from the `callback_ids` parameter; without it the step
/// waits on [`CallbackStep::default_callback_id`].
#[derive(Debug)]
pub struct CallbackStep {
    step_type: String,
    executions: Mutex<Vec<String>>,
    aborted: Mutex<Vec<String>>,
}

impl CallbackStep {
    /// Creates a callback step.
    #[must_use]
    pub fn new(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            executions: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
        }
    }

    /// The callback id used when no `callback_ids` parameter is set.
    #[must_use]
    pub fn default_callback_id(plan_node_id: &str, retry_index: u32) -> String {
        format!("{plan_node_id}#{retry_index}")
    }

    /// Returns the number of dispatched executions.
    #[must_use]
    pub fn execution_count(&self) -> usize {
        self.executions.lock().len()
    }

    /// Returns the number of abort requests received.
    #[must_use]
    pub fn abort_count(&self) -> usize {
        self.aborted.lock().len()
    }

    /// Returns the node execution ids that were asked to abort.
    #[must_use]
    pub fn aborted_nodes(&self) -> Vec<String> {
        self.aborted.lock().clone()
    }

    fn callback_ids(ctx: &StepContext) -> Vec<String> {
        ctx.parameters
            .get("callback_ids")
            .and_then(serde_json::Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(serde_json::Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| {
                vec![Self::default_callback_id(
                    &ctx.plan_node.uuid,
                    ctx.retry_index,
                )]
            })
    }
}

#[async_trait]
impl Step for CallbackStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    async fn facilitate(&self, _ctx: &StepContext) -> Option<FacilitatorResponse> {
        Some(FacilitatorResponse::new(ExecutionMode::Async))
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Executable, StepError> {
        self.executions.lock().push(ctx.node_execution_id.clone());
        Ok(Executable::Async(AsyncExecutableResponse::new(
            Self::callback_ids(ctx),
        )))
    }

    async fn handle_abort(&self, ctx: &StepContext) {
        self.aborted.lock().push(ctx.node_execution_id.clone());
    }
}

/// Builds a callback payload that the default async handling reads as a
/// step response.
#[must_use]
pub fn callback_response(response: &StepResponse) -> ResponseData {
    serde_json::to_value(response).unwrap_or(serde_json::Value::Null)
}
