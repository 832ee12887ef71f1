//! Timeout instance persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::tracker::{TimeoutTracker, TrackerState};
use crate::errors::Result;

/// What a fired timeout does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TimeoutCallback {
    /// The node ran past its deadline.
    ExpireNode {
        /// Node execution id.
        node_execution_id: String,
    },
    /// An aborting node did not acknowledge in time.
    AbortGrace {
        /// Node execution id.
        node_execution_id: String,
    },
    /// An advised retry wait has elapsed.
    RetryAfterWait {
        /// Node execution id of the failed attempt.
        node_execution_id: String,
    },
}

impl TimeoutCallback {
    /// The node this callback targets.
    #[must_use]
    pub fn node_execution_id(&self) -> &str {
        match self {
            Self::ExpireNode { node_execution_id }
            | Self::AbortGrace { node_execution_id }
            | Self::RetryAfterWait { node_execution_id } => node_execution_id,
        }
    }
}

/// A scheduled deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutInstance {
    /// Instance id.
    pub uuid: String,
    /// Deadline computation.
    pub tracker: TrackerState,
    /// Action on expiry.
    pub callback: TimeoutCallback,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Storage for timeout instances.
#[async_trait]
pub trait TimeoutStore: Send + Sync {
    /// Inserts or replaces an instance.
    async fn save(&self, instance: TimeoutInstance) -> Result<()>;

    /// Reads an instance.
    async fn get(&self, instance_id: &str) -> Result<Option<TimeoutInstance>>;

    /// Deletes instances, returning how many existed.
    async fn delete(&self, instance_ids: &[String]) -> Result<usize>;

    /// Removes and returns every instance expired at `now`. Each instance is
    /// handed to exactly one caller.
    async fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<TimeoutInstance>>;

    /// Deletes instances whose callback targets one of `node_execution_ids`.
    async fn delete_for_nodes(&self, node_execution_ids: &[String]) -> Result<usize>;
}

/// Timeout instances in a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryTimeoutStore {
    instances: DashMap<String, TimeoutInstance>,
}

impl InMemoryTimeoutStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of scheduled instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Returns true if nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[async_trait]
impl TimeoutStore for InMemoryTimeoutStore {
    async fn save(&self, instance: TimeoutInstance) -> Result<()> {
        self.instances.insert(instance.uuid.clone(), instance);
        Ok(())
    }

    async fn get(&self, instance_id: &str) -> Result<Option<TimeoutInstance>> {
        Ok(self.instances.get(instance_id).map(|i| i.value().clone()))
    }

    async fn delete(&self, instance_ids: &[String]) -> Result<usize> {
        Ok(instance_ids
            .iter()
            .filter(|id| self.instances.remove(*id).is_some())
            .count())
    }

    async fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<TimeoutInstance>> {
        let due: Vec<String> = self
            .instances
            .iter()
            .filter(|i| i.tracker.is_expired(now))
            .map(|i| i.key().clone())
            .collect();

        let mut claimed: Vec<TimeoutInstance> = due
            .iter()
            .filter_map(|id| self.instances.remove(id).map(|(_, i)| i))
            .collect();
        claimed.sort_by_key(|i| i.tracker.expires_at());
        Ok(claimed)
    }

    async fn delete_for_nodes(&self, node_execution_ids: &[String]) -> Result<usize> {
        let nodes: HashSet<&str> = node_execution_ids.iter().map(String::as_str).collect();
        let before = self.instances.len();
        self.instances
            .retain(|_, i| !nodes.contains(i.callback.node_execution_id()));
        Ok(before - self.instances.len())
    }
}
