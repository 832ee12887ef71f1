//! Wait/notify: durable suspension of nodes on external callbacks.
//!
//! A suspended node holds no thread. Its continuation is a persisted
//! [`WaitInstance`]; when every correlation id has been notified a
//! resume unit of work is published on the bus.

mod store;

pub use store::{InMemoryWaitStore, RecordOutcome, WaitInstance, WaitStore};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::{NodeExecution, ResponseData};
use crate::errors::Result;
use crate::events::{EngineMessage, EventBus, OrchestrationEvent, OrchestrationEventSink};
use crate::store::NodeDeleteObserver;
use crate::utils::Clock;

/// What a notify did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// The wait is now complete and the node will resume.
    Resolved,
    /// Attached to a wait that still expects other responses.
    Pending,
    /// Held until a wait registers for this correlation id.
    Buffered,
    /// Already received; dropped.
    Duplicate,
}

/// Registers waits and accepts notifies.
pub struct WaitService {
    store: Arc<dyn WaitStore>,
    bus: Arc<dyn EventBus>,
    events: Arc<dyn OrchestrationEventSink>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for WaitService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitService").finish_non_exhaustive()
    }
}

impl WaitService {
    /// Creates a wait service.
    #[must_use]
    pub fn new(
        store: Arc<dyn WaitStore>,
        bus: Arc<dyn EventBus>,
        events: Arc<dyn OrchestrationEventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            bus,
            events,
            clock,
        }
    }

    /// Persists a wait for `node_execution_id` on `correlation_ids`.
    ///
    /// Responses that arrived before registration are applied now; if they
    /// complete the wait the node resumes immediately.
    pub async fn register_wait(
        &self,
        notify_id: &str,
        node_execution_id: &str,
        plan_execution_id: &str,
        correlation_ids: Vec<String>,
    ) -> Result<WaitInstance> {
        let wait = WaitInstance::new(
            notify_id,
            node_execution_id,
            plan_execution_id,
            correlation_ids,
            self.clock.now(),
        );
        let wait = self.store.register(wait).await?;
        debug!(
            notify_id = %wait.uuid,
            node_execution_id = %wait.node_execution_id,
            correlation_ids = ?wait.correlation_ids,
            buffered = wait.responses.len(),
            "Registered wait"
        );

        if wait.is_complete() {
            self.resolve(&wait.uuid).await?;
        }
        Ok(wait)
    }

    /// Delivers a response for `correlation_id`. Safe to repeat.
    pub async fn notify(&self, correlation_id: &str, data: ResponseData) -> Result<NotifyOutcome> {
        match self.store.record_response(correlation_id, data).await? {
            RecordOutcome::Duplicate(Some(wait)) if !wait.resolved && wait.is_complete() => {
                // An earlier resolution could not be handed off; try again.
                self.resolve(&wait.uuid).await?;
                Ok(NotifyOutcome::Resolved)
            }
            RecordOutcome::Duplicate(_) => {
                info!(correlation_id = %correlation_id, "Dropping duplicate notify");
                self.events.try_emit(&OrchestrationEvent::NotifyDropped {
                    correlation_id: correlation_id.to_string(),
                    reason: "duplicate".to_string(),
                });
                Ok(NotifyOutcome::Duplicate)
            }
            RecordOutcome::Buffered => {
                debug!(correlation_id = %correlation_id, "Buffered notify ahead of its wait");
                Ok(NotifyOutcome::Buffered)
            }
            RecordOutcome::Attached(wait) => {
                if wait.resolved {
                    info!(
                        correlation_id = %correlation_id,
                        notify_id = %wait.uuid,
                        "Dropping notify for a closed wait"
                    );
                    self.events.try_emit(&OrchestrationEvent::NotifyDropped {
                        correlation_id: correlation_id.to_string(),
                        reason: "wait closed".to_string(),
                    });
                    Ok(NotifyOutcome::Duplicate)
                } else if wait.is_complete() {
                    self.resolve(&wait.uuid).await?;
                    Ok(NotifyOutcome::Resolved)
                } else {
                    Ok(NotifyOutcome::Pending)
                }
            }
        }
    }

    /// Cancels a wait; later notifies for it are dropped.
    pub async fn cancel_wait(&self, notify_id: &str) -> Result<bool> {
        self.store.cancel(notify_id).await
    }

    /// Reads a wait.
    pub async fn get(&self, notify_id: &str) -> Result<Option<WaitInstance>> {
        self.store.get(notify_id).await
    }

    async fn resolve(&self, notify_id: &str) -> Result<()> {
        let Some(wait) = self.store.try_resolve(notify_id).await? else {
            return Ok(());
        };

        let message = EngineMessage::ResumeNode {
            node_execution_id: wait.node_execution_id.clone(),
            notify_id: wait.uuid.clone(),
            responses: wait.responses.clone(),
        };
        if let Err(err) = message.publish(self.bus.as_ref()).await {
            warn!(notify_id = %wait.uuid, error = %err, "Could not publish resume, reopening wait");
            self.store.unresolve(&wait.uuid).await?;
            return Err(err);
        }
        debug!(
            notify_id = %wait.uuid,
            node_execution_id = %wait.node_execution_id,
            "Wait resolved"
        );
        Ok(())
    }
}

#[async_trait]
impl NodeDeleteObserver for WaitService {
    async fn on_nodes_delete(&self, nodes: &[NodeExecution]) -> Result<()> {
        let ids: Vec<String> = nodes.iter().map(|n| n.uuid.clone()).collect();
        let deleted = self.store.delete_for_nodes(&ids).await?;
        debug!(deleted, "Deleted waits of pruned nodes");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CollectingEventSink, InMemoryEventBus, Topic};
    use crate::utils::SystemClock;
    use std::time::Duration;

    fn service() -> (WaitService, Arc<InMemoryEventBus>, Arc<CollectingEventSink>) {
        let bus = Arc::new(InMemoryEventBus::default());
        let sink = Arc::new(CollectingEventSink::new());
        let svc = WaitService::new(
            Arc::new(InMemoryWaitStore::new()),
            bus.clone(),
            sink.clone(),
            Arc::new(SystemClock),
        );
        (svc, bus, sink)
    }

    async fn resumes(bus: &InMemoryEventBus) -> Vec<EngineMessage> {
        bus.read(Topic::NodeResume, 100, Duration::ZERO)
            .await
            .unwrap()
            .iter()
            .map(|m| EngineMessage::decode(m).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_notify_resolves_wait() {
        let (svc, bus, _) = service();
        svc.register_wait("w1", "n1", "pe1", vec!["cb1".into()])
            .await
            .unwrap();

        let outcome = svc.notify("cb1", serde_json::json!({"status": "succeeded"})).await.unwrap();
        assert_eq!(outcome, NotifyOutcome::Resolved);

        let messages = resumes(&bus).await;
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            EngineMessage::ResumeNode {
                node_execution_id,
                responses,
                ..
            } => {
                assert_eq!(node_execution_id, "n1");
                assert_eq!(responses["cb1"]["status"], "succeeded");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_double_notify_equals_single_notify() {
        let (svc, bus, sink) = service();
        svc.register_wait("w1", "n1", "pe1", vec!["cb1".into()])
            .await
            .unwrap();

        svc.notify("cb1", serde_json::json!(1)).await.unwrap();
        let state_after_one = svc.get("w1").await.unwrap();

        let outcome = svc.notify("cb1", serde_json::json!(2)).await.unwrap();
        assert_eq!(outcome, NotifyOutcome::Duplicate);
        assert_eq!(svc.get("w1").await.unwrap(), state_after_one);
        assert_eq!(resumes(&bus).await.len(), 1);
        assert_eq!(sink.events_of_type("waiter.").len(), 1);
    }

    #[tokio::test]
    async fn test_waits_for_all_correlation_ids() {
        let (svc, bus, _) = service();
        svc.register_wait("w1", "n1", "pe1", vec!["a".into(), "b".into()])
            .await
            .unwrap();

        assert_eq!(svc.notify("a", serde_json::json!(1)).await.unwrap(), NotifyOutcome::Pending);
        assert!(resumes(&bus).await.is_empty());
        assert_eq!(svc.notify("b", serde_json::json!(2)).await.unwrap(), NotifyOutcome::Resolved);
        assert_eq!(resumes(&bus).await.len(), 1);
    }

    #[tokio::test]
    async fn test_notify_before_wait() {
        let (svc, bus, _) = service();
        assert_eq!(
            svc.notify("cb1", serde_json::json!("fast")).await.unwrap(),
            NotifyOutcome::Buffered
        );

        let wait = svc
            .register_wait("w1", "n1", "pe1", vec!["cb1".into()])
            .await
            .unwrap();
        assert!(wait.is_complete());
        assert_eq!(resumes(&bus).await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_wait_drops_notify() {
        let (svc, bus, _) = service();
        svc.register_wait("w1", "n1", "pe1", vec!["cb1".into()])
            .await
            .unwrap();
        assert!(svc.cancel_wait("w1").await.unwrap());

        assert_eq!(
            svc.notify("cb1", serde_json::json!(1)).await.unwrap(),
            NotifyOutcome::Duplicate
        );
        assert!(resumes(&bus).await.is_empty());
    }

    #[tokio::test]
    async fn test_resolution_retried_after_bus_outage() {
        let (svc, bus, _) = service();
        svc.register_wait("w1", "n1", "pe1", vec!["cb1".into()])
            .await
            .unwrap();

        bus.set_available(false);
        assert!(svc.notify("cb1", serde_json::json!(1)).await.is_err());
        bus.set_available(true);

        assert_eq!(
            svc.notify("cb1", serde_json::json!(1)).await.unwrap(),
            NotifyOutcome::Resolved
        );
        assert_eq!(resumes(&bus).await.len(), 1);
    }
}
