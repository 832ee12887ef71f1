//! Test fixtures: plan builders and an engine harness.

use chrono::{TimeZone, Utc};
use std::sync::Arc;

use crate::advise::AdviserObtainment;
use crate::config::EngineConfig;
use crate::core::{Ambiance, NodeExecution, NodeGroup, Plan, PlanNode, Status};
use crate::engine::{Engine, EnginePersistence};
use crate::errors::Result;
use crate::events::CollectingEventSink;
use crate::facilitator::FacilitatorType;
use crate::registry::Registry;
use crate::steps::{ForkStep, SectionStep};
use crate::utils::ManualClock;

/// Step type of the section fixtures.
pub const SECTION_STEP: &str = "Stage";
/// Step type of the fork fixtures.
pub const FORK_STEP: &str = "Parallel";

/// A sync leaf node.
#[must_use]
pub fn step_node(uuid: &str, step_type: &str) -> PlanNode {
    PlanNode::new(uuid, step_type).with_group(NodeGroup::Step)
}

/// A stage that runs the chain starting at `child`.
#[must_use]
pub fn section_node(uuid: &str, child: &str) -> PlanNode {
    PlanNode::new(uuid, SECTION_STEP)
        .with_group(NodeGroup::Stage)
        .with_facilitator(FacilitatorType::Child)
        .with_parameters(serde_json::json!({ "child_node_id": child }))
}

/// A fork over `children`, optionally bounded.
#[must_use]
pub fn fork_node(uuid: &str, children: &[&str], max_concurrency: Option<usize>) -> PlanNode {
    PlanNode::new(uuid, FORK_STEP)
        .with_group(NodeGroup::StepGroup)
        .with_facilitator(FacilitatorType::Children)
        .with_parameters(serde_json::json!({
            "children": children,
            "max_concurrency": max_concurrency,
        }))
}

/// Chains `nodes` in order with next-step advisers.
#[must_use]
pub fn chain(nodes: Vec<PlanNode>) -> Vec<PlanNode> {
    let next_ids: Vec<Option<String>> = nodes
        .iter()
        .skip(1)
        .map(|n| Some(n.uuid.clone()))
        .chain(std::iter::once(None))
        .collect();
    nodes
        .into_iter()
        .zip(next_ids)
        .map(|(node, next)| match next {
            Some(next) => node.with_adviser(AdviserObtainment::next_step(next)),
            None => node,
        })
        .collect()
}

/// A plan starting at the first of `nodes`.
#[must_use]
pub fn plan_of(plan_id: &str, nodes: Vec<PlanNode>) -> Plan {
    let starting = nodes.first().map(|n| n.uuid.clone()).unwrap_or_default();
    nodes
        .into_iter()
        .fold(Plan::new(plan_id, starting), Plan::with_node)
}

/// A linear plan of sync steps, each followed by the next.
#[must_use]
pub fn linear_plan(plan_id: &str, step_type: &str, ids: &[&str]) -> Plan {
    let nodes = ids.iter().map(|id| step_node(id, step_type)).collect();
    plan_of(plan_id, chain(nodes))
}

/// A plan whose root forks over sync leaves of `step_type`.
#[must_use]
pub fn fork_plan(plan_id: &str, step_type: &str, children: &[&str], max_concurrency: Option<usize>) -> Plan {
    let mut nodes = vec![fork_node("fork", children, max_concurrency)];
    nodes.extend(children.iter().map(|id| step_node(id, step_type)));
    plan_of(plan_id, nodes)
}

/// Registry with the section and fork steps the fixtures use.
#[must_use]
pub fn fixture_registry() -> Registry {
    Registry::new()
        .with_step(Arc::new(SectionStep::new(SECTION_STEP)))
        .with_step(Arc::new(ForkStep::new(FORK_STEP)))
}

/// An engine on in-memory persistence, a manual clock and a collecting sink.
pub struct TestEngine {
    /// The engine under test.
    pub engine: Engine,
    /// Clock driving timeouts.
    pub clock: Arc<ManualClock>,
    /// Every emitted orchestration event.
    pub events: Arc<CollectingEventSink>,
    /// Persistence shared with any restarted engine.
    pub persistence: EnginePersistence,
}

impl TestEngine {
    /// Builds a harness over `registry` with the default config.
    #[must_use]
    pub fn new(registry: Registry) -> Self {
        Self::with_config(registry, EngineConfig::default())
    }

    /// Builds a harness over `registry` with `config`.
    #[must_use]
    pub fn with_config(registry: Registry, config: EngineConfig) -> Self {
        let persistence = EnginePersistence::in_memory(&config);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_else(Utc::now),
        ));
        let events = Arc::new(CollectingEventSink::new());
        let engine = Engine::builder()
            .with_config(config)
            .with_registry(registry)
            .with_persistence(persistence.clone())
            .with_clock(clock.clone())
            .with_event_sink(events.clone())
            .build();
        Self {
            engine,
            clock,
            events,
            persistence,
        }
    }

    /// Builds a second engine over the same persistence and clock, as a
    /// process restart would.
    #[must_use]
    pub fn restart(&self, registry: Registry) -> Engine {
        Engine::builder()
            .with_config(self.engine.config().clone())
            .with_registry(registry)
            .with_persistence(self.persistence.clone())
            .with_clock(self.clock.clone())
            .with_event_sink(self.events.clone())
            .build()
    }

    /// Starts `plan` under a plan execution id derived from the plan id.
    pub async fn start(&self, plan: Plan) -> Result<String> {
        let plan_execution_id = format!("{}-run", plan.uuid);
        let plan_id = plan.uuid.clone();
        self.engine
            .start_plan(plan, Ambiance::new(plan_execution_id, plan_id))
            .await
    }

    /// Processes everything that is ready.
    pub async fn run(&self) -> Result<usize> {
        self.engine.run_until_idle().await
    }

    /// Moves the clock forward, then processes what became due.
    pub async fn advance_ms(&self, ms: i64) -> Result<usize> {
        self.clock.advance_ms(ms);
        self.run().await
    }

    /// Every attempt of `plan_node_id`, oldest first.
    pub async fn attempts(&self, plan_execution_id: &str, plan_node_id: &str) -> Result<Vec<NodeExecution>> {
        let mut nodes: Vec<NodeExecution> = self
            .engine
            .nodes_for_plan(plan_execution_id)
            .await?
            .into_iter()
            .filter(|n| n.plan_node_id == plan_node_id)
            .collect();
        nodes.sort_by_key(NodeExecution::retry_index);
        Ok(nodes)
    }

    /// The latest attempt of `plan_node_id`.
    pub async fn latest(&self, plan_execution_id: &str, plan_node_id: &str) -> Result<Option<NodeExecution>> {
        Ok(self
            .attempts(plan_execution_id, plan_node_id)
            .await?
            .into_iter()
            .rfind(|n| !n.old_retry))
    }

    /// The status of the latest attempt of `plan_node_id`.
    pub async fn node_status(&self, plan_execution_id: &str, plan_node_id: &str) -> Result<Option<Status>> {
        Ok(self
            .latest(plan_execution_id, plan_node_id)
            .await?
            .map(|n| n.status))
    }

    /// The plan execution status.
    pub async fn plan_status(&self, plan_execution_id: &str) -> Result<Option<Status>> {
        Ok(self
            .engine
            .plan_execution(plan_execution_id)
            .await?
            .map(|p| p.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_links_next_steps() {
        let nodes = chain(vec![step_node("a", "Shell"), step_node("b", "Shell"), step_node("c", "Shell")]);

        assert_eq!(nodes[0].referenced_node_ids(), vec!["b"]);
        assert_eq!(nodes[1].referenced_node_ids(), vec!["c"]);
        assert!(nodes[2].referenced_node_ids().is_empty());
    }

    #[test]
    fn test_linear_plan() {
        let plan = linear_plan("p1", "Shell", &["a", "b"]);

        assert_eq!(plan.starting_node_id, "a");
        assert_eq!(plan.nodes.len(), 2);
        plan.validate().unwrap();
    }

    #[test]
    fn test_fork_plan() {
        let plan = fork_plan("p1", "Shell", &["x", "y"], Some(1));

        assert_eq!(plan.starting_node_id, "fork");
        let fork = plan.node("fork").unwrap();
        assert_eq!(fork.step_parameters["children"], serde_json::json!(["x", "y"]));
        assert_eq!(fork.step_parameters["max_concurrency"], serde_json::json!(1));
        plan.validate().unwrap();
    }

    #[tokio::test]
    async fn test_harness_starts_plan() {
        let harness = TestEngine::new(fixture_registry());
        let pe = harness
            .start(plan_of("p1", vec![fork_node("fork", &[], None)]))
            .await
            .unwrap();

        assert_eq!(pe, "p1-run");
        harness.run().await.unwrap();
        assert_eq!(harness.plan_status(&pe).await.unwrap(), Some(Status::Succeeded));
    }
}
