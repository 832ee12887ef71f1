//! The interrupt manager.
//!
//! Registration validates and persists an [`Interrupt`], then publishes a
//! processing unit of work. Nothing is applied inline; the engine's
//! interrupt handler does that when the message is consumed.

mod store;

pub use store::{InMemoryInterruptStore, Interrupt, InterruptState, InterruptStore, InterruptType};

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::{EngineError, Result};
use crate::events::{EngineMessage, EventBus};
use crate::store::{NodeExecutionStore, PlanExecutionStore};
use crate::utils::{dedupe_key, generate_id, Clock};

/// A request to register an interrupt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptRequest {
    /// Target plan execution.
    pub plan_execution_id: String,
    /// Signal.
    pub interrupt_type: InterruptType,
    /// Target node; `None` for plan-scoped signals.
    pub node_execution_id: Option<String>,
    /// Free-form metadata.
    pub metadata: HashMap<String, String>,
}

impl InterruptRequest {
    /// A plan-scoped request.
    #[must_use]
    pub fn for_plan(plan_execution_id: impl Into<String>, interrupt_type: InterruptType) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            interrupt_type,
            node_execution_id: None,
            metadata: HashMap::new(),
        }
    }

    /// A node-scoped request.
    #[must_use]
    pub fn for_node(
        plan_execution_id: impl Into<String>,
        interrupt_type: InterruptType,
        node_execution_id: impl Into<String>,
    ) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            interrupt_type,
            node_execution_id: Some(node_execution_id.into()),
            metadata: HashMap::new(),
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn dedupe_key(&self) -> String {
        let kind = self.interrupt_type.to_string();
        dedupe_key(&[
            self.plan_execution_id.as_str(),
            kind.as_str(),
            self.node_execution_id.as_deref().unwrap_or(""),
        ])
    }
}

/// Validates, persists and enqueues interrupts.
pub struct InterruptManager {
    store: Arc<dyn InterruptStore>,
    bus: Arc<dyn EventBus>,
    plans: Arc<dyn PlanExecutionStore>,
    nodes: Arc<dyn NodeExecutionStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InterruptManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptManager").finish_non_exhaustive()
    }
}

impl InterruptManager {
    /// Creates an interrupt manager.
    #[must_use]
    pub fn new(
        store: Arc<dyn InterruptStore>,
        bus: Arc<dyn EventBus>,
        plans: Arc<dyn PlanExecutionStore>,
        nodes: Arc<dyn NodeExecutionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            bus,
            plans,
            nodes,
            clock,
        }
    }

    /// Registers an interrupt and enqueues its processing. Returns the
    /// interrupt id; an identical interrupt that has not finished processing
    /// is returned instead of registering a new one.
    pub async fn register_interrupt(&self, request: InterruptRequest) -> Result<String> {
        self.validate(&request).await?;

        let interrupt = Interrupt {
            uuid: generate_id(),
            plan_execution_id: request.plan_execution_id.clone(),
            interrupt_type: request.interrupt_type,
            node_execution_id: request.node_execution_id.clone(),
            state: InterruptState::Registered,
            created_at: self.clock.now(),
            metadata: request.metadata.clone(),
            dedupe_key: request.dedupe_key(),
        };
        let candidate = interrupt.uuid.clone();
        let stored = self.store.register(interrupt).await?;
        if stored.uuid != candidate {
            info!(
                interrupt_id = %stored.uuid,
                interrupt_type = %stored.interrupt_type,
                "Interrupt already registered"
            );
            return Ok(stored.uuid);
        }

        let message = EngineMessage::ProcessInterrupt {
            interrupt_id: stored.uuid.clone(),
        };
        if let Err(err) = message.publish(self.bus.as_ref()).await {
            warn!(interrupt_id = %stored.uuid, error = %err, "Could not enqueue interrupt");
            self.store
                .compare_and_set_state(&stored.uuid, InterruptState::Registered, InterruptState::Discarded)
                .await?;
            return Err(err);
        }

        info!(
            interrupt_id = %stored.uuid,
            plan_execution_id = %stored.plan_execution_id,
            node_execution_id = ?stored.node_execution_id,
            interrupt_type = %stored.interrupt_type,
            "Registered interrupt"
        );
        Ok(stored.uuid)
    }

    /// Reads an interrupt.
    pub async fn get(&self, interrupt_id: &str) -> Result<Option<Interrupt>> {
        self.store.get(interrupt_id).await
    }

    /// Interrupts of a plan execution.
    pub async fn list(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>> {
        self.store.list_by_plan(plan_execution_id).await
    }

    /// Claims a registered interrupt for processing. Returns `None` if it is
    /// unknown or another worker already claimed or finished it.
    pub async fn claim(&self, interrupt_id: &str) -> Result<Option<Interrupt>> {
        let Some(interrupt) = self.store.get(interrupt_id).await? else {
            return Ok(None);
        };
        let claimed = self
            .store
            .compare_and_set_state(interrupt_id, InterruptState::Registered, InterruptState::Processing)
            .await?;
        if claimed {
            Ok(Some(Interrupt {
                state: InterruptState::Processing,
                ..interrupt
            }))
        } else {
            debug!(interrupt_id, state = %interrupt.state, "Interrupt already claimed");
            Ok(None)
        }
    }

    /// Records the outcome of processing.
    pub async fn finish(&self, interrupt_id: &str, state: InterruptState) -> Result<()> {
        self.store
            .compare_and_set_state(interrupt_id, InterruptState::Processing, state)
            .await?;
        Ok(())
    }

    async fn validate(&self, request: &InterruptRequest) -> Result<()> {
        let kind = request.interrupt_type;
        match (kind.is_plan_scoped(), &request.node_execution_id) {
            (true, Some(_)) => {
                return Err(EngineError::invalid(format!("{kind} does not take a node")));
            }
            (false, None) => {
                return Err(EngineError::invalid(format!("{kind} requires a node")));
            }
            _ => {}
        }

        let plan = self
            .plans
            .get(&request.plan_execution_id)
            .await?
            .ok_or_else(|| EngineError::not_found("plan execution", &request.plan_execution_id))?;
        if plan.status.is_terminal() {
            return Err(EngineError::invalid(format!(
                "plan execution {} is already {}",
                plan.uuid, plan.status
            )));
        }

        let Some(node_id) = &request.node_execution_id else {
            return Ok(());
        };
        let node = self
            .nodes
            .get(node_id)
            .await?
            .ok_or_else(|| EngineError::not_found("node execution", node_id))?;
        if node.plan_execution_id() != plan.uuid {
            return Err(EngineError::invalid(format!(
                "node execution {node_id} does not belong to plan execution {}",
                plan.uuid
            )));
        }

        let allowed = match kind {
            InterruptType::Retry => node.status.is_retryable() && !node.old_retry,
            InterruptType::MarkSuccess => !node.status.is_terminal() || node.status.is_broken(),
            _ => !node.status.is_terminal(),
        };
        if allowed {
            Ok(())
        } else {
            Err(EngineError::invalid(format!(
                "{kind} is not valid for node execution {node_id} in status {}",
                node.status
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Ambiance, Level, NodeExecution, PlanExecution, PlanNode, Status};
    use crate::events::{InMemoryEventBus, Topic};
    use crate::store::{InMemoryNodeExecutionStore, InMemoryPlanExecutionStore};
    use crate::utils::SystemClock;
    use chrono::Utc;
    use std::time::Duration;

    struct Fixture {
        manager: InterruptManager,
        bus: Arc<InMemoryEventBus>,
        nodes: Arc<InMemoryNodeExecutionStore>,
    }

    async fn fixture() -> Fixture {
        let bus = Arc::new(InMemoryEventBus::default());
        let plans = Arc::new(InMemoryPlanExecutionStore::new());
        let nodes = Arc::new(InMemoryNodeExecutionStore::new());
        plans
            .insert(PlanExecution::new(Ambiance::new("pe", "p"), Utc::now()))
            .await
            .unwrap();
        let manager = InterruptManager::new(
            Arc::new(InMemoryInterruptStore::new()),
            bus.clone(),
            plans,
            nodes.clone(),
            Arc::new(SystemClock),
        );
        Fixture { manager, bus, nodes }
    }

    async fn add_node(nodes: &InMemoryNodeExecutionStore, id: &str, status: Status) {
        let level = Level::for_node(id, &PlanNode::new("a", "Shell"), 0, Utc::now());
        let mut node = NodeExecution::new(Ambiance::new("pe", "p").clone_for_child(level), Utc::now());
        node.status = status;
        nodes.insert(node).await.unwrap();
    }

    #[tokio::test]
    async fn test_register_enqueues_processing() {
        let f = fixture().await;
        let id = f
            .manager
            .register_interrupt(InterruptRequest::for_plan("pe", InterruptType::AbortAll))
            .await
            .unwrap();

        let messages = f.bus.read(Topic::Interrupt, 10, Duration::ZERO).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            EngineMessage::decode(&messages[0]).unwrap(),
            EngineMessage::ProcessInterrupt { interrupt_id: id.clone() }
        );
        assert_eq!(
            f.manager.get(&id).await.unwrap().unwrap().state,
            InterruptState::Registered
        );
    }

    #[tokio::test]
    async fn test_duplicate_registration_returns_existing() {
        let f = fixture().await;
        add_node(&f.nodes, "n1", Status::Running).await;
        let request = InterruptRequest::for_node("pe", InterruptType::Abort, "n1");

        let first = f.manager.register_interrupt(request.clone()).await.unwrap();
        let second = f.manager.register_interrupt(request.clone()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.bus.pending(Topic::Interrupt).await.unwrap(), 1);

        // Once processed, the same signal may be raised again.
        f.manager.claim(&first).await.unwrap().unwrap();
        f.manager
            .finish(&first, InterruptState::ProcessedSuccessfully)
            .await
            .unwrap();
        let third = f.manager.register_interrupt(request).await.unwrap();
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn test_scope_validation() {
        let f = fixture().await;
        let err = f
            .manager
            .register_interrupt(InterruptRequest::for_plan("pe", InterruptType::Abort))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");

        let err = f
            .manager
            .register_interrupt(InterruptRequest::for_plan("missing", InterruptType::PauseAll))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_retry_requires_failed_node() {
        let f = fixture().await;
        add_node(&f.nodes, "ok", Status::Succeeded).await;
        add_node(&f.nodes, "bad", Status::Failed).await;

        assert!(f
            .manager
            .register_interrupt(InterruptRequest::for_node("pe", InterruptType::Retry, "ok"))
            .await
            .is_err());
        assert!(f
            .manager
            .register_interrupt(InterruptRequest::for_node("pe", InterruptType::Retry, "bad"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let f = fixture().await;
        let id = f
            .manager
            .register_interrupt(InterruptRequest::for_plan("pe", InterruptType::PauseAll))
            .await
            .unwrap();

        assert!(f.manager.claim(&id).await.unwrap().is_some());
        assert!(f.manager.claim(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_outage_discards_interrupt() {
        let f = fixture().await;
        f.bus.set_available(false);
        let err = f
            .manager
            .register_interrupt(InterruptRequest::for_plan("pe", InterruptType::AbortAll))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let all = f.manager.list("pe").await.unwrap();
        assert_eq!(all[0].state, InterruptState::Discarded);
    }
}
