//! The orchestration engine.
//!
//! The engine drives node executions through their lifecycle by consuming
//! units of work from the event bus. Every handler reads the persisted
//! records it needs, applies a compare-and-swap write, and publishes the
//! follow-up work; no handler keeps state between messages, so any worker
//! can pick up any message and a restarted engine continues from the stores.
//!
//! ```rust,ignore
//! let engine = EngineBuilder::new()
//!     .with_registry(Registry::new().with_step(Arc::new(MyStep)))
//!     .build();
//! let plan_execution_id = engine.start_plan(plan, Ambiance::new(generate_id(), "p1")).await?;
//! let workers = engine.spawn_workers();
//! ```

mod conclude;
mod interrupt_handler;
mod resume;
mod start;
mod transitions;
mod worker;


use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::core::{Ambiance, NodeExecution, Plan, PlanExecution, ResponseData, Status};
use crate::errors::{EngineError, Result};
use crate::events::{
    EngineMessage, EventBus, InMemoryEventBus, LoggingEventSink, Message, OrchestrationEventSink,
    StartNodeRequest, Topic,
};
use crate::interrupts::{
    InMemoryInterruptStore, Interrupt, InterruptManager, InterruptRequest, InterruptStore,
};
use crate::observability::SpanTimer;
use crate::registry::Registry;
use crate::restraint::{
    InMemoryRestraintStore, ResourceRestraint, ResourceRestraintService, RestraintStore,
};
use crate::rollback::{InMemoryRollbackOutputStore, RollbackAggregator, RollbackInfo, RollbackOutputStore};
use crate::steps::ResourceConstraintStep;
use crate::store::{
    InMemoryNodeExecutionStore, InMemoryPlanExecutionStore, NodeDeleteObserver, NodeExecutionStore,
    PlanExecutionStore,
};
use crate::timeout::{InMemoryTimeoutStore, TimeoutService, TimeoutStore};
use crate::utils::{generate_id, Clock, SystemClock};
use crate::waiter::{InMemoryWaitStore, NotifyOutcome, WaitService, WaitStore};

const MAX_IDLE_PASSES: usize = 10_000;

/// Every durable record the engine reads and writes, plus the bus.
///
/// Two engines built over clones of the same persistence share all state,
/// which is how a restart is modelled.
#[derive(Clone)]
pub struct EnginePersistence {
    /// Node executions.
    pub nodes: Arc<dyn NodeExecutionStore>,
    /// Plan executions and their plans.
    pub plans: Arc<dyn PlanExecutionStore>,
    /// The event bus.
    pub bus: Arc<dyn EventBus>,
    /// Wait instances.
    pub waits: Arc<dyn WaitStore>,
    /// Interrupts.
    pub interrupts: Arc<dyn InterruptStore>,
    /// Timeout instances.
    pub timeouts: Arc<dyn TimeoutStore>,
    /// Resource restraints and their instances.
    pub restraints: Arc<dyn RestraintStore>,
    /// Published rollback information.
    pub rollback_outputs: Arc<dyn RollbackOutputStore>,
}

impl EnginePersistence {
    /// In-memory stores and bus.
    #[must_use]
    pub fn in_memory(config: &EngineConfig) -> Self {
        Self {
            nodes: Arc::new(InMemoryNodeExecutionStore::new()),
            plans: Arc::new(InMemoryPlanExecutionStore::new()),
            bus: Arc::new(InMemoryEventBus::new(config.bus_visibility_timeout())),
            waits: Arc::new(InMemoryWaitStore::new()),
            interrupts: Arc::new(InMemoryInterruptStore::new()),
            timeouts: Arc::new(InMemoryTimeoutStore::new()),
            restraints: Arc::new(InMemoryRestraintStore::new()),
            rollback_outputs: Arc::new(InMemoryRollbackOutputStore::new()),
        }
    }
}

impl std::fmt::Debug for EnginePersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginePersistence").finish_non_exhaustive()
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Registry,
    persistence: Option<EnginePersistence>,
    events: Arc<dyn OrchestrationEventSink>,
    clock: Arc<dyn Clock>,
    delete_observers: Vec<Arc<dyn NodeDeleteObserver>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            registry: Registry::new(),
            persistence: None,
            events: Arc::new(LoggingEventSink::default()),
            clock: Arc::new(SystemClock),
            delete_observers: Vec::new(),
        }
    }
}

impl EngineBuilder {
    /// Creates a builder with defaults: in-memory persistence, the system
    /// clock and a logging event sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the plugin registry.
    #[must_use]
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Uses existing stores and bus.
    #[must_use]
    pub fn with_persistence(mut self, persistence: EnginePersistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Sets the orchestration event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn OrchestrationEventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Adds an observer notified when node executions are pruned.
    #[must_use]
    pub fn with_delete_observer(mut self, observer: Arc<dyn NodeDeleteObserver>) -> Self {
        self.delete_observers.push(observer);
        self
    }

    /// Builds the engine.
    ///
    /// The resource constraint step is registered automatically unless the
    /// registry already has a step under its type.
    #[must_use]
    pub fn build(self) -> Engine {
        let persistence = self
            .persistence
            .unwrap_or_else(|| EnginePersistence::in_memory(&self.config));

        let waiter = Arc::new(WaitService::new(
            persistence.waits.clone(),
            persistence.bus.clone(),
            self.events.clone(),
            self.clock.clone(),
        ));
        let timeouts = Arc::new(TimeoutService::new(
            persistence.timeouts.clone(),
            persistence.bus.clone(),
            self.clock.clone(),
        ));
        let interrupts = Arc::new(InterruptManager::new(
            persistence.interrupts.clone(),
            persistence.bus.clone(),
            persistence.plans.clone(),
            persistence.nodes.clone(),
            self.clock.clone(),
        ));
        let restraints = Arc::new(ResourceRestraintService::new(
            persistence.restraints.clone(),
            waiter.clone(),
            self.events.clone(),
            self.clock.clone(),
        ));
        let rollback = Arc::new(RollbackAggregator::new(
            persistence.nodes.clone(),
            persistence.rollback_outputs.clone(),
        ));

        let registry = if self.registry.has_step(ResourceConstraintStep::STEP_TYPE) {
            self.registry
        } else {
            self.registry
                .with_step(Arc::new(ResourceConstraintStep::new(restraints.clone())))
        };

        let mut delete_observers: Vec<Arc<dyn NodeDeleteObserver>> = vec![
            waiter.clone(),
            timeouts.clone(),
            restraints.clone(),
            rollback.clone(),
        ];
        delete_observers.extend(self.delete_observers);

        Engine {
            config: Arc::new(self.config),
            registry: Arc::new(registry),
            clock: self.clock,
            nodes: persistence.nodes,
            plans: persistence.plans,
            bus: persistence.bus,
            events: self.events,
            waiter,
            timeouts,
            interrupts,
            restraints,
            rollback,
            delete_observers: Arc::new(delete_observers),
        }
    }
}

/// The node execution engine. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Engine {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) nodes: Arc<dyn NodeExecutionStore>,
    pub(crate) plans: Arc<dyn PlanExecutionStore>,
    pub(crate) bus: Arc<dyn EventBus>,
    pub(crate) events: Arc<dyn OrchestrationEventSink>,
    pub(crate) waiter: Arc<WaitService>,
    pub(crate) timeouts: Arc<TimeoutService>,
    pub(crate) interrupts: Arc<InterruptManager>,
    pub(crate) restraints: Arc<ResourceRestraintService>,
    pub(crate) rollback: Arc<RollbackAggregator>,
    delete_observers: Arc<Vec<Arc<dyn NodeDeleteObserver>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Shortcut for [`EngineBuilder::new`].
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The resource restraint service.
    #[must_use]
    pub fn restraints(&self) -> &Arc<ResourceRestraintService> {
        &self.restraints
    }

    /// The timeout service.
    #[must_use]
    pub fn timeouts(&self) -> &Arc<TimeoutService> {
        &self.timeouts
    }

    /// Starts a plan execution at its starting node.
    ///
    /// The plan execution id is taken from `ambiance`; an empty id gets a
    /// fresh one. Returns the plan execution id.
    pub async fn start_plan(&self, plan: Plan, ambiance: Ambiance) -> Result<String> {
        plan.validate()?;

        let mut ambiance = ambiance;
        if ambiance.plan_execution_id.is_empty() {
            ambiance.plan_execution_id = generate_id();
        }
        if ambiance.plan_id.is_empty() {
            ambiance.plan_id.clone_from(&plan.uuid);
        }
        ambiance.levels.clear();

        let plan_execution_id = ambiance.plan_execution_id.clone();
        let starting_node_id = plan.starting_node_id.clone();
        let execution = PlanExecution::new(ambiance.clone(), self.clock.now());
        if !self.plans.insert(execution).await? {
            return Err(EngineError::invalid(format!(
                "Plan execution '{plan_execution_id}' already exists"
            )));
        }
        self.plans.save_plan(&plan_execution_id, plan).await?;
        self.emit_plan_status(&plan_execution_id, Status::Running).await;

        self.enqueue_start(StartNodeRequest {
            node_execution_id: generate_id(),
            plan_node_id: starting_node_id,
            ambiance,
            parent_id: None,
            previous_id: None,
            retry_index: 0,
            retry_ids: Vec::new(),
        })
        .await?;

        info!(plan_execution_id = %plan_execution_id, "Started plan execution");
        Ok(plan_execution_id)
    }

    /// Delivers an external completion for `correlation_id`.
    pub async fn notify(&self, correlation_id: &str, data: ResponseData) -> Result<NotifyOutcome> {
        self.waiter.notify(correlation_id, data).await
    }

    /// Registers an interrupt; it is applied when its message is consumed.
    pub async fn register_interrupt(&self, request: InterruptRequest) -> Result<String> {
        self.interrupts.register_interrupt(request).await
    }

    /// Registers or replaces a resource restraint.
    pub async fn register_restraint(&self, restraint: ResourceRestraint) -> Result<()> {
        self.restraints.register_restraint(restraint).await
    }

    /// Reads a plan execution.
    pub async fn plan_execution(&self, plan_execution_id: &str) -> Result<Option<PlanExecution>> {
        self.plans.get(plan_execution_id).await
    }

    /// Reads a node execution.
    pub async fn node(&self, node_execution_id: &str) -> Result<Option<NodeExecution>> {
        self.nodes.get(node_execution_id).await
    }

    /// All node executions of a plan execution.
    pub async fn nodes_for_plan(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        self.nodes.fetch_by_plan_execution(plan_execution_id).await
    }

    /// Interrupts registered against a plan execution.
    pub async fn interrupts(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>> {
        self.interrupts.list(plan_execution_id).await
    }

    /// Rollback information published for a node.
    pub async fn rollback_info(&self, node_execution_id: &str) -> Result<Option<RollbackInfo>> {
        self.rollback.get(node_execution_id).await
    }

    /// Applies one unit of work.
    pub async fn process_message(&self, message: EngineMessage) -> Result<()> {
        match message {
            EngineMessage::StartNode(request) => self.handle_start(request).await,
            EngineMessage::ResumeNode {
                node_execution_id,
                notify_id,
                responses,
            } => {
                self.handle_resume(&node_execution_id, &notify_id, responses)
                    .await
            }
            EngineMessage::NodeConcluded { node_execution_id } => {
                self.handle_concluded(&node_execution_id).await
            }
            EngineMessage::ProcessInterrupt { interrupt_id } => {
                self.handle_interrupt(&interrupt_id).await
            }
            EngineMessage::TimeoutFired {
                timeout_instance_id,
                callback,
            } => self.handle_timeout(&timeout_instance_id, callback).await,
            EngineMessage::PromoteRestraint {
                restraint_id,
                resource_unit,
            } => self
                .restraints
                .promote(&restraint_id, &resource_unit)
                .await
                .map(|_| ()),
        }
    }

    /// Decodes, applies and acknowledges one delivered message.
    ///
    /// Transient failures leave the message unacknowledged so the bus
    /// redelivers it; any other failure is logged and acknowledged.
    pub async fn handle_delivery(&self, topic: Topic, message: &Message) -> Result<()> {
        let decoded = match EngineMessage::decode(message) {
            Ok(decoded) => decoded,
            Err(err) => {
                error!(topic = %topic, message_id = %message.id, error = %err, "Dropping undecodable message");
                return self.bus.acknowledge(topic, &message.id).await;
            }
        };

        let timer = SpanTimer::start(decoded.kind());
        match self.process_message(decoded).await {
            Ok(()) => {
                timer.finish();
                self.bus.acknowledge(topic, &message.id).await
            }
            Err(err) if err.is_transient() => {
                timer.fail(&err);
                Err(err)
            }
            Err(err) => {
                timer.fail(&err);
                error!(
                    topic = %topic,
                    message_id = %message.id,
                    code = err.code(),
                    error = %err,
                    "Unit of work failed"
                );
                self.bus.acknowledge(topic, &message.id).await
            }
        }
    }

    /// Processes queued messages and due timeouts until nothing is left.
    ///
    /// Returns the number of units processed. Meant for tests and
    /// single-process embedding; long-running deployments use
    /// [`Engine::spawn_workers`].
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut total = 0;
        for _ in 0..MAX_IDLE_PASSES {
            let mut processed = 0;
            for topic in Topic::ALL {
                let messages = self
                    .bus
                    .read(topic, self.config.consumer.batch_size, Duration::ZERO)
                    .await?;
                for message in &messages {
                    self.handle_delivery(topic, message).await?;
                    processed += 1;
                }
            }
            processed += self.timeouts.fire_due().await?;

            if processed == 0 {
                return Ok(total);
            }
            total += processed;
        }
        Err(EngineError::Internal(format!(
            "engine still busy after {MAX_IDLE_PASSES} passes"
        )))
    }

    /// Deletes the node executions of a finished plan execution and lets
    /// every delete observer clean up derived records.
    pub async fn prune_plan(&self, plan_execution_id: &str) -> Result<usize> {
        let execution = self
            .plans
            .get(plan_execution_id)
            .await?
            .ok_or_else(|| EngineError::not_found("plan execution", plan_execution_id))?;
        if !execution.status.is_terminal() {
            return Err(EngineError::invalid(format!(
                "Plan execution '{plan_execution_id}' is still {}",
                execution.status
            )));
        }

        let ids: Vec<String> = self
            .nodes
            .fetch_by_plan_execution(plan_execution_id)
            .await?
            .into_iter()
            .filter(|n| n.status.is_terminal())
            .map(|n| n.uuid)
            .collect();
        let deleted = self.nodes.delete_many(&ids).await?;
        for observer in self.delete_observers.iter() {
            observer.on_nodes_delete(&deleted).await?;
        }

        info!(plan_execution_id, deleted = deleted.len(), "Pruned plan execution");
        Ok(deleted.len())
    }
}
