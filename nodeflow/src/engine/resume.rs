//! Resumption of suspended nodes and fired timeouts.

use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::Engine;
use crate::core::{ResponseData, Status, StepResponse};
use crate::errors::Result;
use crate::interrupts::{InterruptRequest, InterruptType};
use crate::steps::StepContext;
use crate::timeout::TimeoutCallback;

impl Engine {
    pub(crate) async fn handle_resume(
        &self,
        node_execution_id: &str,
        notify_id: &str,
        responses: HashMap<String, ResponseData>,
    ) -> Result<()> {
        let Some(node) = self.nodes.get(node_execution_id).await? else {
            warn!(node_execution_id, notify_id, "Resume for unknown node");
            return Ok(());
        };
        if node.notify_id.as_deref() != Some(notify_id) {
            debug!(node_execution_id, notify_id, "Dropping resume for a superseded wait");
            return Ok(());
        }
        if node.status.is_terminal() {
            info!(node_execution_id, status = %node.status, "Dropping resume for concluded node");
            return Ok(());
        }

        if node.status == Status::Discontinuing {
            debug!(node_execution_id, "Abort acknowledged");
            return self.conclude(node_execution_id, StepResponse::aborted()).await;
        }

        if node.paused {
            debug!(node_execution_id, "Buffering responses while paused");
            self.update_node(node_execution_id, |n| {
                n.buffered_responses = Some(responses.clone());
                Ok(true)
            })
            .await?;
            return Ok(());
        }

        self.apply_responses(node_execution_id, &responses).await
    }

    /// Hands collected callback responses to the node's step and concludes.
    pub(crate) async fn apply_responses(
        &self,
        node_execution_id: &str,
        responses: &HashMap<String, ResponseData>,
    ) -> Result<()> {
        let node = self.require_node(node_execution_id).await?;
        let plan = self.plan_for(node.plan_execution_id()).await?;
        let response = match (plan.node(&node.plan_node_id), self.registry.step(&node.step_type)) {
            (Some(plan_node), Ok(step)) => {
                let ctx = StepContext::new(&node, plan_node);
                step.handle_async_response(&ctx, responses).await
            }
            (None, _) => StepResponse::errored(format!("Plan node '{}' not found", node.plan_node_id)),
            (_, Err(err)) => StepResponse::errored(err.to_string()),
        };
        self.conclude(node_execution_id, response).await
    }

    pub(crate) async fn handle_timeout(&self, timeout_instance_id: &str, callback: TimeoutCallback) -> Result<()> {
        let node_execution_id = callback.node_execution_id();
        let Some(node) = self.nodes.get(node_execution_id).await? else {
            debug!(timeout_instance_id, node_execution_id, "Timeout for unknown node");
            return Ok(());
        };

        match callback {
            TimeoutCallback::ExpireNode { .. } => {
                if node.status.is_terminal() {
                    return Ok(());
                }
                info!(timeout_instance_id, node_execution_id, "Node deadline passed");
                let request = InterruptRequest::for_node(
                    node.plan_execution_id(),
                    InterruptType::MarkExpired,
                    node_execution_id,
                )
                .with_metadata("timeout_instance_id", timeout_instance_id);
                match self.interrupts.register_interrupt(request).await {
                    Ok(_) => Ok(()),
                    Err(err) if err.is_transient() => Err(err),
                    Err(err) => {
                        debug!(node_execution_id, error = %err, "Expiry not registered");
                        Ok(())
                    }
                }
            }
            TimeoutCallback::AbortGrace { .. } => {
                if node.status != Status::Discontinuing {
                    return Ok(());
                }
                warn!(node_execution_id, "Abort not acknowledged in time; forcing aborted");
                self.conclude(node_execution_id, StepResponse::aborted()).await
            }
            TimeoutCallback::RetryAfterWait { .. } => {
                if !node.awaiting_retry {
                    return Ok(());
                }
                self.create_retry(node_execution_id).await.map(|_| ())
            }
        }
    }
}
