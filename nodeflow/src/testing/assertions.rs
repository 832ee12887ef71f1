//! Test assertions for node and plan executions.

use crate::core::{NodeExecution, PlanExecution, Status};
use crate::events::CollectingEventSink;

/// Asserts that the node has the expected status.
pub fn assert_node_status(node: &NodeExecution, expected: Status) {
    assert_eq!(
        node.status, expected,
        "Expected node '{}' ({}) to be {:?}, got {:?}",
        node.plan_node_id, node.uuid, expected, node.status
    );
}

/// Asserts that the plan execution has the expected status.
pub fn assert_plan_status(execution: &PlanExecution, expected: Status) {
    assert_eq!(
        execution.status, expected,
        "Expected plan execution '{}' to be {:?}, got {:?}",
        execution.uuid, expected, execution.status
    );
}

/// Asserts that every node is terminal and nothing waits on a retry.
pub fn assert_all_concluded(nodes: &[NodeExecution]) {
    let open: Vec<(&str, Status)> = nodes
        .iter()
        .filter(|n| n.is_pending())
        .map(|n| (n.plan_node_id.as_str(), n.status))
        .collect();
    assert!(open.is_empty(), "Expected every node to be concluded, still open: {open:?}");
}

/// Asserts that every observed node transition follows the status graph.
///
/// Each node must be created as `Queued`, and each transition must start
/// where the previous one ended.
pub fn assert_valid_transitions(events: &CollectingEventSink) {
    for (node_execution_id, transitions) in events.node_transitions() {
        let mut current: Option<Status> = None;
        for (from, to) in transitions {
            match (current, from) {
                (None, None) => assert_eq!(
                    to,
                    Status::Queued,
                    "Node {node_execution_id} was created as {to:?}"
                ),
                (Some(previous), Some(from)) => {
                    assert_eq!(
                        previous, from,
                        "Node {node_execution_id} moved from {from:?} while in {previous:?}"
                    );
                    assert!(
                        from.can_transition_to(to),
                        "Node {node_execution_id} made invalid transition {from:?} -> {to:?}"
                    );
                }
                (current, from) => panic!(
                    "Node {node_execution_id} has inconsistent history: at {current:?}, event from {from:?}"
                ),
            }
            current = Some(to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Ambiance, Level, PlanNode};
    use crate::events::{OrchestrationEvent, OrchestrationEventSink};
    use chrono::Utc;

    fn node(status: Status) -> NodeExecution {
        let plan_node = PlanNode::new("a", "Shell");
        let ambiance = Ambiance::new("pe1", "p1").clone_for_child(Level::for_node("rt", &plan_node, 0, Utc::now()));
        let mut node = NodeExecution::new(ambiance, Utc::now());
        node.status = status;
        node
    }

    fn transition(from: Option<Status>, to: Status) -> OrchestrationEvent {
        OrchestrationEvent::NodeStatusChanged {
            node_execution_id: "rt".to_string(),
            plan_execution_id: "pe1".to_string(),
            plan_node_id: "a".to_string(),
            from,
            to,
        }
    }

    #[test]
    fn test_assert_node_status() {
        assert_node_status(&node(Status::Running), Status::Running);
    }

    #[test]
    #[should_panic(expected = "Expected node 'a'")]
    fn test_assert_node_status_fails() {
        assert_node_status(&node(Status::Running), Status::Failed);
    }

    #[test]
    #[should_panic(expected = "still open")]
    fn test_assert_all_concluded_fails_on_awaiting_retry() {
        let mut failed = node(Status::Failed);
        failed.awaiting_retry = true;
        assert_all_concluded(&[node(Status::Succeeded), failed]);
    }

    #[tokio::test]
    async fn test_valid_transitions() {
        let sink = CollectingEventSink::new();
        sink.emit(&transition(None, Status::Queued)).await;
        sink.emit(&transition(Some(Status::Queued), Status::Running)).await;
        sink.emit(&transition(Some(Status::Running), Status::Failed)).await;
        sink.emit(&transition(Some(Status::Failed), Status::IgnoreFailed)).await;

        assert_valid_transitions(&sink);
    }

    #[tokio::test]
    #[should_panic(expected = "invalid transition")]
    async fn test_invalid_transition_detected() {
        let sink = CollectingEventSink::new();
        sink.emit(&transition(None, Status::Queued)).await;
        sink.emit(&transition(Some(Status::Queued), Status::Succeeded)).await;

        assert_valid_transitions(&sink);
    }
}
