//! The timeout engine.
//!
//! Deadlines are persisted as [`TimeoutInstance`]s. A poller claims expired
//! instances and publishes a timeout unit of work for each; the engine turns
//! node expiry into an expire interrupt.

mod store;
mod tracker;

pub use store::{InMemoryTimeoutStore, TimeoutCallback, TimeoutInstance, TimeoutStore};
pub use tracker::{
    AbsoluteTimeoutTracker, ActiveTimeoutTracker, TimeoutEvent, TimeoutTracker, TrackerKind,
    TrackerState,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::NodeExecution;
use crate::errors::Result;
use crate::events::{EngineMessage, EventBus};
use crate::store::NodeDeleteObserver;
use crate::utils::{generate_id, Clock};

/// A deadline attached to a plan node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutObtainment {
    /// Tracker kind.
    #[serde(default)]
    pub kind: TrackerKind,
    /// Allowed duration in milliseconds.
    pub timeout_ms: u64,
}

impl TimeoutObtainment {
    /// A wall-clock deadline.
    #[must_use]
    pub fn absolute(timeout_ms: u64) -> Self {
        Self {
            kind: TrackerKind::Absolute,
            timeout_ms,
        }
    }

    /// A running-time deadline.
    #[must_use]
    pub fn active(timeout_ms: u64) -> Self {
        Self {
            kind: TrackerKind::Active,
            timeout_ms,
        }
    }
}

/// Schedules, adjusts and fires timeouts.
pub struct TimeoutService {
    store: Arc<dyn TimeoutStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TimeoutService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutService").finish_non_exhaustive()
    }
}

impl TimeoutService {
    /// Creates a timeout service.
    #[must_use]
    pub fn new(store: Arc<dyn TimeoutStore>, bus: Arc<dyn EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self { store, bus, clock }
    }

    /// Schedules a timeout, returning its id.
    pub async fn schedule(&self, tracker: TrackerState, callback: TimeoutCallback) -> Result<String> {
        let instance = TimeoutInstance {
            uuid: generate_id(),
            tracker,
            callback,
            created_at: self.clock.now(),
        };
        let id = instance.uuid.clone();
        debug!(
            timeout_instance_id = %id,
            callback = ?instance.callback,
            expires_at = ?instance.tracker.expires_at(),
            "Scheduled timeout"
        );
        self.store.save(instance).await?;
        Ok(id)
    }

    /// Schedules a timeout of `timeout_ms` from now.
    pub async fn schedule_after(&self, timeout_ms: u64, callback: TimeoutCallback) -> Result<String> {
        let tracker = TrackerState::start(TrackerKind::Absolute, self.clock.now(), timeout_ms);
        self.schedule(tracker, callback).await
    }

    /// Schedules the node-expiry deadlines of `obtainments`.
    pub async fn schedule_node_timeouts(
        &self,
        node_execution_id: &str,
        obtainments: &[TimeoutObtainment],
    ) -> Result<Vec<String>> {
        let now = self.clock.now();
        let mut ids = Vec::with_capacity(obtainments.len());
        for obtainment in obtainments {
            let tracker = TrackerState::start(obtainment.kind, now, obtainment.timeout_ms);
            let id = self
                .schedule(
                    tracker,
                    TimeoutCallback::ExpireNode {
                        node_execution_id: node_execution_id.to_string(),
                    },
                )
                .await?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Cancels timeouts.
    pub async fn cancel(&self, instance_ids: &[String]) -> Result<usize> {
        if instance_ids.is_empty() {
            return Ok(0);
        }
        self.store.delete(instance_ids).await
    }

    /// Forwards a pause/resume signal to the given timeouts.
    pub async fn on_event(&self, instance_ids: &[String], event: TimeoutEvent) -> Result<()> {
        let now = self.clock.now();
        for id in instance_ids {
            if let Some(mut instance) = self.store.get(id).await? {
                instance.tracker.on_event(event, now);
                self.store.save(instance).await?;
            }
        }
        Ok(())
    }

    /// Reads a timeout.
    pub async fn get(&self, instance_id: &str) -> Result<Option<TimeoutInstance>> {
        self.store.get(instance_id).await
    }

    /// Claims expired timeouts and publishes their callbacks. Returns how
    /// many fired.
    pub async fn fire_due(&self) -> Result<usize> {
        let due = self.store.claim_due(self.clock.now()).await?;
        let mut fired = 0;
        let mut pending = due.into_iter();

        while let Some(instance) = pending.next() {
            let message = EngineMessage::TimeoutFired {
                timeout_instance_id: instance.uuid.clone(),
                callback: instance.callback.clone(),
            };
            if let Err(err) = message.publish(self.bus.as_ref()).await {
                warn!(error = %err, "Could not publish fired timeouts, rescheduling");
                self.store.save(instance).await?;
                for rest in pending {
                    self.store.save(rest).await?;
                }
                return Err(err);
            }
            debug!(timeout_instance_id = %instance.uuid, "Timeout fired");
            fired += 1;
        }
        Ok(fired)
    }
}

#[async_trait]
impl NodeDeleteObserver for TimeoutService {
    async fn on_nodes_delete(&self, nodes: &[NodeExecution]) -> Result<()> {
        let ids: Vec<String> = nodes.iter().map(|n| n.uuid.clone()).collect();
        let deleted = self.store.delete_for_nodes(&ids).await?;
        debug!(deleted, "Deleted timeouts of pruned nodes");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{InMemoryEventBus, Topic};
    use crate::utils::ManualClock;
    use std::time::Duration;

    fn service() -> (TimeoutService, Arc<InMemoryTimeoutStore>, Arc<InMemoryEventBus>, Arc<ManualClock>) {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let bus = Arc::new(InMemoryEventBus::default());
        let clock = Arc::new(ManualClock::default());
        let svc = TimeoutService::new(store.clone(), bus.clone(), clock.clone());
        (svc, store, bus, clock)
    }

    fn expire(node: &str) -> TimeoutCallback {
        TimeoutCallback::ExpireNode {
            node_execution_id: node.to_string(),
        }
    }

    #[tokio::test]
    async fn test_fires_only_after_deadline() {
        let (svc, store, bus, clock) = service();
        svc.schedule_after(1000, expire("n1")).await.unwrap();

        clock.advance_ms(999);
        assert_eq!(svc.fire_due().await.unwrap(), 0);

        clock.advance_ms(1);
        assert_eq!(svc.fire_due().await.unwrap(), 1);
        assert!(store.is_empty());

        let messages = bus.read(Topic::Timeout, 10, Duration::ZERO).await.unwrap();
        let decoded = EngineMessage::decode(&messages[0]).unwrap();
        assert!(matches!(
            decoded,
            EngineMessage::TimeoutFired { callback: TimeoutCallback::ExpireNode { .. }, .. }
        ));

        // Claimed instances never fire twice.
        assert_eq!(svc.fire_due().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_prevents_firing() {
        let (svc, _, _, clock) = service();
        let ids = svc
            .schedule_node_timeouts("n1", &[TimeoutObtainment::absolute(10)])
            .await
            .unwrap();
        assert_eq!(svc.cancel(&ids).await.unwrap(), 1);

        clock.advance_ms(100);
        assert_eq!(svc.fire_due().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_active_timeout_paused() {
        let (svc, _, _, clock) = service();
        let ids = svc
            .schedule_node_timeouts("n1", &[TimeoutObtainment::active(1000)])
            .await
            .unwrap();

        clock.advance_ms(500);
        svc.on_event(&ids, TimeoutEvent::Pause).await.unwrap();
        clock.advance_ms(10_000);
        assert_eq!(svc.fire_due().await.unwrap(), 0);

        svc.on_event(&ids, TimeoutEvent::Resume).await.unwrap();
        clock.advance_ms(499);
        assert_eq!(svc.fire_due().await.unwrap(), 0);
        clock.advance_ms(1);
        assert_eq!(svc.fire_due().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_outage_reschedules() {
        let (svc, store, bus, clock) = service();
        svc.schedule_after(0, expire("n1")).await.unwrap();
        svc.schedule_after(0, expire("n2")).await.unwrap();
        clock.advance_ms(1);

        bus.set_available(false);
        assert!(svc.fire_due().await.is_err());
        assert_eq!(store.len(), 2);

        bus.set_available(true);
        assert_eq!(svc.fire_due().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_observer_removes_node_timeouts() {
        let (svc, store, _, _) = service();
        svc.schedule_after(10, expire("n1")).await.unwrap();
        svc.schedule_after(10, expire("n2")).await.unwrap();

        let mut node = NodeExecution::new(crate::core::Ambiance::new("pe", "p"), chrono::Utc::now());
        node.uuid = "n1".to_string();
        svc.on_nodes_delete(&[node]).await.unwrap();
        assert_eq!(store.len(), 1);
    }
}
