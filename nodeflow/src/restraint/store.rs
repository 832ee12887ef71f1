//! Restraint and restraint instance persistence.
//!
//! Promotion and release run under the store's lock, so concurrent
//! promotion passes can never grant more slots than the capacity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::core::{Ambiance, NodeGroup};
use crate::errors::Result;

/// A named, capacity-bounded resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRestraint {
    /// Restraint id.
    pub restraint_id: String,
    /// Maximum concurrent holders per resource unit.
    pub capacity: usize,
}

impl ResourceRestraint {
    /// Creates a restraint.
    #[must_use]
    pub fn new(restraint_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            restraint_id: restraint_id.into(),
            capacity,
        }
    }
}

/// How long a granted slot is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldingScope {
    /// Until the plan execution ends.
    Plan,
    /// Until the enclosing stage concludes.
    Stage,
    /// Until the acquiring step concludes.
    #[default]
    Step,
}

impl HoldingScope {
    /// The entity whose conclusion releases the slot, resolved at `ambiance`.
    #[must_use]
    pub fn release_entity_id(&self, ambiance: &Ambiance) -> Option<String> {
        match self {
            Self::Plan => Some(ambiance.plan_execution_id.clone()),
            Self::Stage => ambiance
                .nearest_level_of(NodeGroup::Stage)
                .map(|l| l.runtime_id.clone()),
            Self::Step => ambiance.current_runtime_id().map(str::to_string),
        }
    }
}

/// Lifecycle of a restraint instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestraintState {
    /// Waiting for a slot.
    Blocked,
    /// Holding a slot.
    Active,
    /// Released.
    Finished,
}

/// One ticket in a resource unit's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRestraintInstance {
    /// Instance id.
    pub uuid: String,
    /// Restraint id.
    pub restraint_id: String,
    /// Resource unit (e.g. an environment name).
    pub resource_unit: String,
    /// Entity whose conclusion releases this instance.
    pub release_entity_id: String,
    /// Holding scope the release entity was resolved from.
    pub holding_scope: HoldingScope,
    /// Queue position; lower is served first.
    pub order: u64,
    /// Current state.
    pub state: RestraintState,
    /// Node that acquired the instance.
    pub node_execution_id: String,
    /// Plan execution of the acquiring node.
    pub plan_execution_id: String,
    /// Correlation id notified on grant.
    #[serde(default)]
    pub callback_id: Option<String>,
    /// True once the grant has been notified.
    #[serde(default)]
    pub notified: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the slot was granted.
    #[serde(default)]
    pub acquired_at: Option<DateTime<Utc>>,
}

/// Storage for restraints and their instances.
#[async_trait]
pub trait RestraintStore: Send + Sync {
    /// Inserts or replaces a restraint.
    async fn save_restraint(&self, restraint: ResourceRestraint) -> Result<()>;

    /// Reads a restraint.
    async fn get_restraint(&self, restraint_id: &str) -> Result<Option<ResourceRestraint>>;

    /// Inserts an instance. `order` is assigned after every existing
    /// instance of the unit when `None`.
    async fn insert_instance(
        &self,
        instance: ResourceRestraintInstance,
        order: Option<u64>,
    ) -> Result<ResourceRestraintInstance>;

    /// Reads an instance.
    async fn get_instance(&self, instance_id: &str) -> Result<Option<ResourceRestraintInstance>>;

    /// Instances of a unit, in queue order.
    async fn instances(&self, restraint_id: &str, resource_unit: &str) -> Result<Vec<ResourceRestraintInstance>>;

    /// Activates blocked instances in ascending order while the unit has
    /// fewer than `capacity` active instances. Returns the newly granted.
    async fn promote(
        &self,
        restraint_id: &str,
        resource_unit: &str,
        capacity: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ResourceRestraintInstance>>;

    /// Marks an instance's grant as notified.
    async fn mark_notified(&self, instance_id: &str) -> Result<()>;

    /// Finishes the unfinished instances released by `release_entity_id`.
    /// Returns the affected `(restraint_id, resource_unit)` pairs.
    async fn finish_by_release_entity(&self, release_entity_id: &str) -> Result<Vec<(String, String)>>;

    /// Finishes the BLOCKED instances acquired by `node_execution_id`.
    /// Returns how many were finished.
    async fn finish_blocked_by_node(&self, node_execution_id: &str) -> Result<usize>;

    /// Deletes instances acquired by or released with the given ids.
    /// Returns the affected `(restraint_id, resource_unit)` pairs.
    async fn delete_for_entities(&self, entity_ids: &[String]) -> Result<Vec<(String, String)>>;
}

#[derive(Debug, Default)]
struct RestraintTables {
    restraints: HashMap<String, ResourceRestraint>,
    instances: Vec<ResourceRestraintInstance>,
}

/// Restraints behind a single lock.
#[derive(Debug, Default)]
pub struct InMemoryRestraintStore {
    tables: Mutex<RestraintTables>,
}

impl InMemoryRestraintStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn queue_key(i: &ResourceRestraintInstance) -> (u64, DateTime<Utc>, String) {
    (i.order, i.created_at, i.uuid.clone())
}

#[async_trait]
impl RestraintStore for InMemoryRestraintStore {
    async fn save_restraint(&self, restraint: ResourceRestraint) -> Result<()> {
        self.tables
            .lock()
            .restraints
            .insert(restraint.restraint_id.clone(), restraint);
        Ok(())
    }

    async fn get_restraint(&self, restraint_id: &str) -> Result<Option<ResourceRestraint>> {
        Ok(self.tables.lock().restraints.get(restraint_id).cloned())
    }

    async fn insert_instance(
        &self,
        mut instance: ResourceRestraintInstance,
        order: Option<u64>,
    ) -> Result<ResourceRestraintInstance> {
        let mut tables = self.tables.lock();
        instance.order = order.unwrap_or_else(|| {
            tables
                .instances
                .iter()
                .filter(|i| {
                    i.restraint_id == instance.restraint_id && i.resource_unit == instance.resource_unit
                })
                .map(|i| i.order + 1)
                .max()
                .unwrap_or(0)
        });
        tables.instances.push(instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<ResourceRestraintInstance>> {
        Ok(self
            .tables
            .lock()
            .instances
            .iter()
            .find(|i| i.uuid == instance_id)
            .cloned())
    }

    async fn instances(&self, restraint_id: &str, resource_unit: &str) -> Result<Vec<ResourceRestraintInstance>> {
        let mut out: Vec<ResourceRestraintInstance> = self
            .tables
            .lock()
            .instances
            .iter()
            .filter(|i| i.restraint_id == restraint_id && i.resource_unit == resource_unit)
            .cloned()
            .collect();
        out.sort_by_key(queue_key);
        Ok(out)
    }

    async fn promote(
        &self,
        restraint_id: &str,
        resource_unit: &str,
        capacity: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ResourceRestraintInstance>> {
        let mut tables = self.tables.lock();
        let in_unit = |i: &ResourceRestraintInstance| {
            i.restraint_id == restraint_id && i.resource_unit == resource_unit
        };

        let active = tables
            .instances
            .iter()
            .filter(|i| in_unit(*i) && i.state == RestraintState::Active)
            .count();
        let free = capacity.saturating_sub(active);
        if free == 0 {
            return Ok(Vec::new());
        }

        let mut blocked: Vec<(u64, DateTime<Utc>, String)> = tables
            .instances
            .iter()
            .filter(|i| in_unit(*i) && i.state == RestraintState::Blocked)
            .map(queue_key)
            .collect();
        blocked.sort();
        let chosen: HashSet<String> = blocked.into_iter().take(free).map(|(_, _, id)| id).collect();

        let mut granted = Vec::with_capacity(chosen.len());
        for instance in tables.instances.iter_mut().filter(|i| chosen.contains(&i.uuid)) {
            instance.state = RestraintState::Active;
            instance.acquired_at = Some(now);
            granted.push(instance.clone());
        }
        granted.sort_by_key(queue_key);
        Ok(granted)
    }

    async fn mark_notified(&self, instance_id: &str) -> Result<()> {
        if let Some(instance) = self
            .tables
            .lock()
            .instances
            .iter_mut()
            .find(|i| i.uuid == instance_id)
        {
            instance.notified = true;
        }
        Ok(())
    }

    async fn finish_by_release_entity(&self, release_entity_id: &str) -> Result<Vec<(String, String)>> {
        let mut affected = BTreeSet::new();
        for instance in self
            .tables
            .lock()
            .instances
            .iter_mut()
            .filter(|i| i.release_entity_id == release_entity_id && i.state != RestraintState::Finished)
        {
            instance.state = RestraintState::Finished;
            affected.insert((instance.restraint_id.clone(), instance.resource_unit.clone()));
        }
        Ok(affected.into_iter().collect())
    }

    async fn finish_blocked_by_node(&self, node_execution_id: &str) -> Result<usize> {
        let mut finished = 0;
        for instance in self
            .tables
            .lock()
            .instances
            .iter_mut()
            .filter(|i| i.node_execution_id == node_execution_id && i.state == RestraintState::Blocked)
        {
            instance.state = RestraintState::Finished;
            finished += 1;
        }
        Ok(finished)
    }

    async fn delete_for_entities(&self, entity_ids: &[String]) -> Result<Vec<(String, String)>> {
        let ids: HashSet<&str> = entity_ids.iter().map(String::as_str).collect();
        let mut affected = BTreeSet::new();
        self.tables.lock().instances.retain(|i| {
            let owned = ids.contains(i.node_execution_id.as_str()) || ids.contains(i.release_entity_id.as_str());
            if owned {
                affected.insert((i.restraint_id.clone(), i.resource_unit.clone()));
            }
            !owned
        });
        Ok(affected.into_iter().collect())
    }
}
