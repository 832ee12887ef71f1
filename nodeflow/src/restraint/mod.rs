//! Resource restraint: a persisted FIFO ticket lock per resource unit.
//!
//! `acquire` queues a BLOCKED ticket, promotion grants tickets in ascending
//! order up to the restraint's capacity, and `release` finishes the tickets
//! held by a concluded entity. Granted tickets that carry a callback id are
//! notified through the waiter, which is how a waiting step resumes.

mod store;

pub use store::{
    HoldingScope, InMemoryRestraintStore, ResourceRestraint, ResourceRestraintInstance,
    RestraintState, RestraintStore,
};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::NodeExecution;
use crate::errors::{EngineError, Result};
use crate::events::{OrchestrationEvent, OrchestrationEventSink};
use crate::store::NodeDeleteObserver;
use crate::utils::{generate_id, Clock};
use crate::waiter::WaitService;

/// A request for a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireRequest {
    /// Restraint id.
    pub restraint_id: String,
    /// Resource unit.
    pub resource_unit: String,
    /// Entity whose conclusion releases the slot.
    pub release_entity_id: String,
    /// Scope the release entity was resolved from.
    pub holding_scope: HoldingScope,
    /// Explicit queue position; appended when `None`.
    pub order: Option<u64>,
    /// Acquiring node.
    pub node_execution_id: String,
    /// Plan execution of the acquiring node.
    pub plan_execution_id: String,
    /// Correlation id to notify when granted.
    pub callback_id: Option<String>,
}

/// Admission control over named resources.
pub struct ResourceRestraintService {
    store: Arc<dyn RestraintStore>,
    waiter: Arc<WaitService>,
    events: Arc<dyn OrchestrationEventSink>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ResourceRestraintService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRestraintService").finish_non_exhaustive()
    }
}

impl ResourceRestraintService {
    /// Creates a restraint service.
    #[must_use]
    pub fn new(
        store: Arc<dyn RestraintStore>,
        waiter: Arc<WaitService>,
        events: Arc<dyn OrchestrationEventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            waiter,
            events,
            clock,
        }
    }

    /// Registers or updates a restraint.
    pub async fn register_restraint(&self, restraint: ResourceRestraint) -> Result<()> {
        info!(
            restraint_id = %restraint.restraint_id,
            capacity = restraint.capacity,
            "Registered resource restraint"
        );
        self.store.save_restraint(restraint).await
    }

    /// Queues a ticket and runs promotion. Returns the ticket as it stands
    /// afterwards (ACTIVE if granted at once).
    pub async fn acquire(&self, request: AcquireRequest) -> Result<ResourceRestraintInstance> {
        if self.store.get_restraint(&request.restraint_id).await?.is_none() {
            return Err(EngineError::not_found("resource restraint", &request.restraint_id));
        }

        let instance = ResourceRestraintInstance {
            uuid: generate_id(),
            restraint_id: request.restraint_id,
            resource_unit: request.resource_unit,
            release_entity_id: request.release_entity_id,
            holding_scope: request.holding_scope,
            order: 0,
            state: RestraintState::Blocked,
            node_execution_id: request.node_execution_id,
            plan_execution_id: request.plan_execution_id,
            callback_id: request.callback_id,
            notified: false,
            created_at: self.clock.now(),
            acquired_at: None,
        };
        let instance = self.store.insert_instance(instance, request.order).await?;
        debug!(
            instance_id = %instance.uuid,
            resource_unit = %instance.resource_unit,
            order = instance.order,
            "Queued restraint instance"
        );

        self.promote(&instance.restraint_id, &instance.resource_unit).await?;
        self.store
            .get_instance(&instance.uuid)
            .await?
            .ok_or_else(|| EngineError::not_found("restraint instance", &instance.uuid))
    }

    /// Grants free slots of a unit and notifies granted tickets. Safe to run
    /// repeatedly or concurrently.
    pub async fn promote(&self, restraint_id: &str, resource_unit: &str) -> Result<Vec<ResourceRestraintInstance>> {
        let restraint = self
            .store
            .get_restraint(restraint_id)
            .await?
            .ok_or_else(|| EngineError::not_found("resource restraint", restraint_id))?;

        let granted = self
            .store
            .promote(restraint_id, resource_unit, restraint.capacity, self.clock.now())
            .await?;
        for instance in &granted {
            info!(
                instance_id = %instance.uuid,
                resource_unit = %instance.resource_unit,
                order = instance.order,
                "Granted resource restraint"
            );
            self.events.try_emit(&OrchestrationEvent::RestraintGranted {
                instance_id: instance.uuid.clone(),
                resource_unit: instance.resource_unit.clone(),
            });
        }

        // Covers grants whose notify failed on an earlier pass.
        for instance in self.store.instances(restraint_id, resource_unit).await? {
            if instance.state != RestraintState::Active || instance.notified {
                continue;
            }
            if let Some(callback_id) = &instance.callback_id {
                let data = serde_json::json!({
                    "restraint_instance_id": instance.uuid,
                    "resource_unit": instance.resource_unit,
                });
                self.waiter.notify(callback_id, data).await?;
            }
            self.store.mark_notified(&instance.uuid).await?;
        }
        Ok(granted)
    }

    /// Finishes the tickets released by `release_entity_id`. Returns the
    /// `(restraint_id, resource_unit)` pairs that need promotion.
    pub async fn release(&self, release_entity_id: &str) -> Result<Vec<(String, String)>> {
        let affected = self.store.finish_by_release_entity(release_entity_id).await?;
        if !affected.is_empty() {
            debug!(release_entity_id, units = ?affected, "Released resource restraints");
        }
        Ok(affected)
    }

    /// Withdraws the tickets a concluded node is still queued on, so they
    /// can never be granted. Held tickets are left to their release entity.
    pub async fn withdraw(&self, node_execution_id: &str) -> Result<usize> {
        let withdrawn = self.store.finish_blocked_by_node(node_execution_id).await?;
        if withdrawn > 0 {
            debug!(node_execution_id, withdrawn, "Withdrew blocked restraint instances");
        }
        Ok(withdrawn)
    }

    /// Number of ACTIVE tickets of a unit.
    pub async fn active_count(&self, restraint_id: &str, resource_unit: &str) -> Result<usize> {
        Ok(self
            .store
            .instances(restraint_id, resource_unit)
            .await?
            .iter()
            .filter(|i| i.state == RestraintState::Active)
            .count())
    }

    /// Tickets of a unit in queue order.
    pub async fn instances(&self, restraint_id: &str, resource_unit: &str) -> Result<Vec<ResourceRestraintInstance>> {
        self.store.instances(restraint_id, resource_unit).await
    }
}

#[async_trait]
impl NodeDeleteObserver for ResourceRestraintService {
    async fn on_nodes_delete(&self, nodes: &[NodeExecution]) -> Result<()> {
        let ids: Vec<String> = nodes.iter().map(|n| n.uuid.clone()).collect();
        let affected = self.store.delete_for_entities(&ids).await?;
        for (restraint_id, resource_unit) in affected {
            self.promote(&restraint_id, &resource_unit).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CollectingEventSink, InMemoryEventBus};
    use crate::utils::ManualClock;
    use crate::waiter::InMemoryWaitStore;
    use pretty_assertions::assert_eq;

    fn service() -> ResourceRestraintService {
        let clock = Arc::new(ManualClock::default());
        let events = Arc::new(CollectingEventSink::new());
        let waiter = Arc::new(WaitService::new(
            Arc::new(InMemoryWaitStore::new()),
            Arc::new(InMemoryEventBus::default()),
            events.clone(),
            clock.clone(),
        ));
        ResourceRestraintService::new(Arc::new(InMemoryRestraintStore::new()), waiter, events, clock)
    }

    fn request(node: &str, order: Option<u64>) -> AcquireRequest {
        AcquireRequest {
            restraint_id: "deploys".into(),
            resource_unit: "env-X".into(),
            release_entity_id: node.into(),
            holding_scope: HoldingScope::Step,
            order,
            node_execution_id: node.into(),
            plan_execution_id: "pe".into(),
            callback_id: None,
        }
    }

    #[tokio::test]
    async fn test_capacity_one_promotes_in_order() {
        let svc = service();
        svc.register_restraint(ResourceRestraint::new("deploys", 1)).await.unwrap();

        let first = svc.acquire(request("n1", Some(1))).await.unwrap();
        let second = svc.acquire(request("n2", Some(2))).await.unwrap();
        assert_eq!(first.state, RestraintState::Active);
        assert_eq!(second.state, RestraintState::Blocked);

        let affected = svc.release("n1").await.unwrap();
        assert_eq!(affected, vec![("deploys".to_string(), "env-X".to_string())]);
        let granted = svc.promote("deploys", "env-X").await.unwrap();
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].uuid, second.uuid);
        assert_eq!(svc.active_count("deploys", "env-X").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_blocked_served_by_ascending_order() {
        let svc = service();
        svc.register_restraint(ResourceRestraint::new("deploys", 1)).await.unwrap();

        svc.acquire(request("holder", Some(0))).await.unwrap();
        svc.acquire(request("late", Some(9))).await.unwrap();
        svc.acquire(request("early", Some(3))).await.unwrap();

        svc.release("holder").await.unwrap();
        let granted = svc.promote("deploys", "env-X").await.unwrap();
        assert_eq!(granted[0].node_execution_id, "early");
    }

    #[tokio::test]
    async fn test_repeated_promotion_never_exceeds_capacity() {
        let svc = service();
        svc.register_restraint(ResourceRestraint::new("deploys", 2)).await.unwrap();
        for i in 0..5 {
            svc.acquire(request(&format!("n{i}"), None)).await.unwrap();
        }

        for _ in 0..3 {
            svc.promote("deploys", "env-X").await.unwrap();
        }
        assert_eq!(svc.active_count("deploys", "env-X").await.unwrap(), 2);

        let orders: Vec<u64> = svc
            .instances("deploys", "env-X")
            .await
            .unwrap()
            .iter()
            .map(|i| i.order)
            .collect();
        assert_eq!(orders, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_withdrawn_ticket_is_never_granted() {
        let svc = service();
        svc.register_restraint(ResourceRestraint::new("deploys", 1)).await.unwrap();

        svc.acquire(request("holder", None)).await.unwrap();
        let mut queued = request("queued", None);
        queued.release_entity_id = "stage".into();
        queued.holding_scope = HoldingScope::Stage;
        svc.acquire(queued).await.unwrap();
        svc.acquire(request("next", None)).await.unwrap();

        assert_eq!(svc.withdraw("queued").await.unwrap(), 1);
        assert_eq!(svc.withdraw("holder").await.unwrap(), 0);

        svc.release("holder").await.unwrap();
        let granted = svc.promote("deploys", "env-X").await.unwrap();
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].node_execution_id, "next");

        let states: Vec<(String, RestraintState)> = svc
            .instances("deploys", "env-X")
            .await
            .unwrap()
            .into_iter()
            .map(|i| (i.node_execution_id, i.state))
            .collect();
        assert_eq!(
            states,
            vec![
                ("holder".to_string(), RestraintState::Finished),
                ("queued".to_string(), RestraintState::Finished),
                ("next".to_string(), RestraintState::Active),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_restraint() {
        let svc = service();
        let err = svc.acquire(request("n1", None)).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_grant_notifies_callback() {
        let svc = service();
        svc.register_restraint(ResourceRestraint::new("deploys", 1)).await.unwrap();
        svc.acquire(request("holder", None)).await.unwrap();

        let mut waiting = request("waiting", None);
        waiting.callback_id = Some("cb-waiting".into());
        svc.acquire(waiting).await.unwrap();

        svc.release("holder").await.unwrap();
        svc.promote("deploys", "env-X").await.unwrap();

        // The grant was buffered for a wait registered later.
        let wait = svc
            .waiter
            .register_wait("notify-1", "waiting", "pe", vec!["cb-waiting".into()])
            .await
            .unwrap();
        assert!(wait.is_complete());
        assert_eq!(wait.responses["cb-waiting"]["resource_unit"], "env-X");
    }

    #[test]
    fn test_holding_scope_resolution() {
        use crate::core::{Ambiance, Level, NodeGroup, PlanNode};
        let now = chrono::Utc::now();
        let stage = PlanNode::new("s", "Stage").with_group(NodeGroup::Stage);
        let step = PlanNode::new("a", "Shell");
        let ambiance = Ambiance::new("pe", "p")
            .clone_for_child(Level::for_node("rt-s", &stage, 0, now))
            .clone_for_child(Level::for_node("rt-a", &step, 0, now));

        assert_eq!(HoldingScope::Plan.release_entity_id(&ambiance).as_deref(), Some("pe"));
        assert_eq!(HoldingScope::Stage.release_entity_id(&ambiance).as_deref(), Some("rt-s"));
        assert_eq!(HoldingScope::Step.release_entity_id(&ambiance).as_deref(), Some("rt-a"));
    }
}
