//! Wait instance persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::core::ResponseData;
use crate::errors::Result;

/// A persisted suspension: a node waiting on a set of correlation ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitInstance {
    /// The notify id (also stored on the node execution).
    pub uuid: String,
    /// The suspended node.
    pub node_execution_id: String,
    /// Plan execution of the node.
    pub plan_execution_id: String,
    /// Correlation ids the node waits on.
    pub correlation_ids: Vec<String>,
    /// Responses received so far.
    #[serde(default)]
    pub responses: HashMap<String, ResponseData>,
    /// True once the resume has been handed off (or the wait cancelled).
    #[serde(default)]
    pub resolved: bool,
    /// True if cancelled rather than resolved.
    #[serde(default)]
    pub cancelled: bool,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

impl WaitInstance {
    /// Creates an unresolved wait.
    #[must_use]
    pub fn new(
        uuid: impl Into<String>,
        node_execution_id: impl Into<String>,
        plan_execution_id: impl Into<String>,
        correlation_ids: Vec<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            node_execution_id: node_execution_id.into(),
            plan_execution_id: plan_execution_id.into(),
            correlation_ids,
            responses: HashMap::new(),
            resolved: false,
            cancelled: false,
            created_at,
        }
    }

    /// Returns true once every correlation id has a response.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.correlation_ids
            .iter()
            .all(|c| self.responses.contains_key(c))
    }
}

/// Result of recording a response.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// A response for this correlation id already exists. Carries the wait
    /// it belongs to, if any.
    Duplicate(Option<WaitInstance>),
    /// No wait is registered yet; the response is held for it.
    Buffered,
    /// The response was attached to a wait.
    Attached(WaitInstance),
}

/// Storage for waits and received responses.
#[async_trait]
pub trait WaitStore: Send + Sync {
    /// Registers a wait, attaching any responses already received for its
    /// correlation ids.
    async fn register(&self, wait: WaitInstance) -> Result<WaitInstance>;

    /// Records a response for `correlation_id`.
    async fn record_response(&self, correlation_id: &str, data: ResponseData) -> Result<RecordOutcome>;

    /// Reads a wait.
    async fn get(&self, notify_id: &str) -> Result<Option<WaitInstance>>;

    /// Marks a complete, unresolved wait as resolved. Returns the wait if
    /// this call made the change.
    async fn try_resolve(&self, notify_id: &str) -> Result<Option<WaitInstance>>;

    /// Reverts a resolution whose resume could not be handed off.
    async fn unresolve(&self, notify_id: &str) -> Result<()>;

    /// Cancels a wait so later responses are dropped. Returns false if it
    /// was already resolved.
    async fn cancel(&self, notify_id: &str) -> Result<bool>;

    /// Deletes the waits of the given nodes and their responses.
    async fn delete_for_nodes(&self, node_execution_ids: &[String]) -> Result<usize>;
}

#[derive(Debug, Default)]
struct WaitTables {
    waits: HashMap<String, WaitInstance>,
    by_correlation: HashMap<String, String>,
    responses: HashMap<String, ResponseData>,
}

/// Waits held behind a single lock, so registration and notify interleave
/// atomically.
#[derive(Debug, Default)]
pub struct InMemoryWaitStore {
    tables: Mutex<WaitTables>,
}

impl InMemoryWaitStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered waits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.lock().waits.len()
    }

    /// Returns true if no waits are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.lock().waits.is_empty()
    }
}

#[async_trait]
impl WaitStore for InMemoryWaitStore {
    async fn register(&self, mut wait: WaitInstance) -> Result<WaitInstance> {
        let mut tables = self.tables.lock();
        for correlation_id in &wait.correlation_ids {
            tables
                .by_correlation
                .insert(correlation_id.clone(), wait.uuid.clone());
            if let Some(data) = tables.responses.get(correlation_id) {
                wait.responses.insert(correlation_id.clone(), data.clone());
            }
        }
        tables.waits.insert(wait.uuid.clone(), wait.clone());
        Ok(wait)
    }

    async fn record_response(&self, correlation_id: &str, data: ResponseData) -> Result<RecordOutcome> {
        let mut tables = self.tables.lock();
        let wait_id = tables.by_correlation.get(correlation_id).cloned();

        if tables.responses.contains_key(correlation_id) {
            let wait = wait_id.and_then(|id| tables.waits.get(&id).cloned());
            return Ok(RecordOutcome::Duplicate(wait));
        }
        tables
            .responses
            .insert(correlation_id.to_string(), data.clone());

        let Some(wait_id) = wait_id else {
            return Ok(RecordOutcome::Buffered);
        };
        match tables.waits.get_mut(&wait_id) {
            Some(wait) => {
                wait.responses.insert(correlation_id.to_string(), data);
                Ok(RecordOutcome::Attached(wait.clone()))
            }
            None => Ok(RecordOutcome::Buffered),
        }
    }

    async fn get(&self, notify_id: &str) -> Result<Option<WaitInstance>> {
        Ok(self.tables.lock().waits.get(notify_id).cloned())
    }

    async fn try_resolve(&self, notify_id: &str) -> Result<Option<WaitInstance>> {
        let mut tables = self.tables.lock();
        match tables.waits.get_mut(notify_id) {
            Some(wait) if !wait.resolved && wait.is_complete() => {
                wait.resolved = true;
                Ok(Some(wait.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn unresolve(&self, notify_id: &str) -> Result<()> {
        if let Some(wait) = self.tables.lock().waits.get_mut(notify_id) {
            if !wait.cancelled {
                wait.resolved = false;
            }
        }
        Ok(())
    }

    async fn cancel(&self, notify_id: &str) -> Result<bool> {
        match self.tables.lock().waits.get_mut(notify_id) {
            Some(wait) if !wait.resolved => {
                wait.resolved = true;
                wait.cancelled = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_for_nodes(&self, node_execution_ids: &[String]) -> Result<usize> {
        let nodes: HashSet<&String> = node_execution_ids.iter().collect();
        let mut tables = self.tables.lock();
        let doomed: Vec<WaitInstance> = tables
            .waits
            .values()
            .filter(|w| nodes.contains(&w.node_execution_id))
            .cloned()
            .collect();

        for wait in &doomed {
            tables.waits.remove(&wait.uuid);
            for correlation_id in &wait.correlation_ids {
                tables.by_correlation.remove(correlation_id);
                tables.responses.remove(correlation_id);
            }
        }
        Ok(doomed.len())
    }
}
