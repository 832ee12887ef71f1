//! Orchestration event sinks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, Level};

use crate::core::Status;

/// Something observable happened inside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum OrchestrationEvent {
    /// A node execution changed status.
    NodeStatusChanged {
        /// Node execution id.
        node_execution_id: String,
        /// Plan execution id.
        plan_execution_id: String,
        /// Plan node id.
        plan_node_id: String,
        /// Previous status; `None` on creation.
        from: Option<Status>,
        /// New status.
        to: Status,
    },
    /// A plan execution changed status.
    PlanStatusChanged {
        /// Plan execution id.
        plan_execution_id: String,
        /// New status.
        status: Status,
    },
    /// An interrupt finished processing.
    InterruptProcessed {
        /// Interrupt id.
        interrupt_id: String,
        /// Plan execution id.
        plan_execution_id: String,
        /// Interrupt type.
        interrupt_type: String,
        /// Final interrupt state.
        state: String,
    },
    /// A notify was dropped.
    NotifyDropped {
        /// Correlation id.
        correlation_id: String,
        /// Why it was dropped.
        reason: String,
    },
    /// A resource restraint slot was granted.
    RestraintGranted {
        /// Restraint instance id.
        instance_id: String,
        /// Resource unit.
        resource_unit: String,
    },
}

impl OrchestrationEvent {
    /// Dotted event type name.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::NodeStatusChanged { .. } => "node.status_changed",
            Self::PlanStatusChanged { .. } => "plan.status_changed",
            Self::InterruptProcessed { .. } => "interrupt.processed",
            Self::NotifyDropped { .. } => "waiter.notify_dropped",
            Self::RestraintGranted { .. } => "restraint.granted",
        }
    }
}

/// Receives orchestration events.
#[async_trait]
pub trait OrchestrationEventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: &OrchestrationEvent);

    /// Emits an event without blocking. Never fails.
    fn try_emit(&self, event: &OrchestrationEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl OrchestrationEventSink for NoOpEventSink {
    async fn emit(&self, _event: &OrchestrationEvent) {}

    fn try_emit(&self, _event: &OrchestrationEvent) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &OrchestrationEvent) {
        let event_type = event.event_type();
        if self.level == Level::DEBUG {
            debug!(event_type = %event_type, event = ?event, "Event: {}", event_type);
        } else {
            info!(event_type = %event_type, event = ?event, "Event: {}", event_type);
        }
    }
}

#[async_trait]
impl OrchestrationEventSink for LoggingEventSink {
    async fn emit(&self, event: &OrchestrationEvent) {
        self.log_event(event);
    }

    fn try_emit(&self, event: &OrchestrationEvent) {
        self.log_event(event);
    }
}

/// Collects events in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<OrchestrationEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected events.
    #[must_use]
    pub fn events(&self) -> Vec<OrchestrationEvent> {
        self.events.read().clone()
    }

    /// Number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Events whose type starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<OrchestrationEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type().starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Observed `(from, to)` transitions per node execution, in order.
    #[must_use]
    pub fn node_transitions(&self) -> std::collections::HashMap<String, Vec<(Option<Status>, Status)>> {
        let mut out: std::collections::HashMap<String, Vec<(Option<Status>, Status)>> =
            std::collections::HashMap::new();
        for event in self.events.read().iter() {
            if let OrchestrationEvent::NodeStatusChanged {
                node_execution_id,
                from,
                to,
                ..
            } = event
            {
                out.entry(node_execution_id.clone())
                    .or_default()
                    .push((*from, *to));
            }
        }
        out
    }
}

#[async_trait]
impl OrchestrationEventSink for CollectingEventSink {
    async fn emit(&self, event: &OrchestrationEvent) {
        self.events.write().push(event.clone());
    }

    fn try_emit(&self, event: &OrchestrationEvent) {
        self.events.write().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_event(node: &str, from: Option<Status>, to: Status) -> OrchestrationEvent {
        OrchestrationEvent::NodeStatusChanged {
            node_execution_id: node.to_string(),
            plan_execution_id: "pe1".to_string(),
            plan_node_id: "setup".to_string(),
            from,
            to,
        }
    }

    #[tokio::test]
    async fn test_noop_and_logging_sinks() {
        let event = status_event("n1", None, Status::Queued);
        NoOpEventSink.emit(&event).await;
        LoggingEventSink::default().emit(&event).await;
        LoggingEventSink::debug().try_emit(&event);
    }

    #[tokio::test]
    async fn test_collecting_sink_filters_by_type() {
        let sink = CollectingEventSink::new();
        sink.emit(&status_event("n1", None, Status::Queued)).await;
        sink.try_emit(&OrchestrationEvent::PlanStatusChanged {
            plan_execution_id: "pe1".into(),
            status: Status::Succeeded,
        });

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.events_of_type("node.").len(), 1);
        assert_eq!(sink.events_of_type("plan.").len(), 1);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_node_transitions_grouped() {
        let sink = CollectingEventSink::new();
        tokio_test::block_on(async {
            sink.emit(&status_event("n1", None, Status::Queued)).await;
            sink.emit(&status_event("n2", None, Status::Queued)).await;
            sink.emit(&status_event("n1", Some(Status::Queued), Status::Running)).await;
        });

        let transitions = sink.node_transitions();
        assert_eq!(
            transitions["n1"],
            vec![(None, Status::Queued), (Some(Status::Queued), Status::Running)]
        );
        assert_eq!(transitions["n2"].len(), 1);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(status_event("n1", None, Status::Queued)).unwrap();
        assert_eq!(json["type"], "node_status_changed");
        assert_eq!(json["to"], "queued");
    }
}
