//! In-memory stores.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use super::{NodeExecutionStore, PlanExecutionStore};
use crate::core::{NodeExecution, Plan, PlanExecution};
use crate::errors::Result;

/// Node executions held in concurrent maps, indexed by parent and by plan
/// execution.
#[derive(Debug, Default)]
pub struct InMemoryNodeExecutionStore {
    nodes: DashMap<String, NodeExecution>,
    children: DashMap<String, Vec<String>>,
    by_plan: DashMap<String, Vec<String>>,
}

impl InMemoryNodeExecutionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn collect(&self, ids: &[String]) -> Vec<NodeExecution> {
        ids.iter()
            .filter_map(|id| self.nodes.get(id).map(|n| n.value().clone()))
            .collect()
    }
}

#[async_trait]
impl NodeExecutionStore for InMemoryNodeExecutionStore {
    async fn insert(&self, node: NodeExecution) -> Result<bool> {
        let id = node.uuid.clone();
        let parent_id = node.parent_id.clone();
        let plan_execution_id = node.plan_execution_id().to_string();

        match self.nodes.entry(id.clone()) {
            Entry::Occupied(_) => return Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(node);
            }
        }

        if let Some(parent_id) = parent_id {
            self.children.entry(parent_id).or_default().push(id.clone());
        }
        self.by_plan.entry(plan_execution_id).or_default().push(id);
        Ok(true)
    }

    async fn get(&self, node_execution_id: &str) -> Result<Option<NodeExecution>> {
        Ok(self.nodes.get(node_execution_id).map(|n| n.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        mut node: NodeExecution,
        expected_version: u64,
    ) -> Result<Option<NodeExecution>> {
        let Some(mut stored) = self.nodes.get_mut(&node.uuid) else {
            return Ok(None);
        };
        if stored.version != expected_version {
            return Ok(None);
        }
        node.version = expected_version + 1;
        *stored = node.clone();
        Ok(Some(node))
    }

    async fn fetch_children(
        &self,
        parent_id: &str,
        include_old_retries: bool,
    ) -> Result<Vec<NodeExecution>> {
        let ids = self
            .children
            .get(parent_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        Ok(self
            .collect(&ids)
            .into_iter()
            .filter(|n| include_old_retries || !n.old_retry)
            .collect())
    }

    async fn fetch_by_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        let ids = self
            .by_plan
            .get(plan_execution_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        Ok(self.collect(&ids))
    }

    async fn delete_many(&self, node_execution_ids: &[String]) -> Result<Vec<NodeExecution>> {
        let mut deleted = Vec::with_capacity(node_execution_ids.len());
        for id in node_execution_ids {
            if let Some((_, node)) = self.nodes.remove(id) {
                if let Some(ref parent_id) = node.parent_id {
                    if let Some(mut siblings) = self.children.get_mut(parent_id) {
                        siblings.retain(|s| s != id);
                    }
                }
                if let Some(mut ids) = self.by_plan.get_mut(node.plan_execution_id()) {
                    ids.retain(|s| s != id);
                }
                self.children.remove(id);
                deleted.push(node);
            }
        }
        Ok(deleted)
    }
}

/// Plans and plan executions held in concurrent maps.
#[derive(Debug, Default)]
pub struct InMemoryPlanExecutionStore {
    plans: DashMap<String, Arc<Plan>>,
    executions: DashMap<String, PlanExecution>,
}

impl InMemoryPlanExecutionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlanExecutionStore for InMemoryPlanExecutionStore {
    async fn save_plan(&self, plan_execution_id: &str, plan: Plan) -> Result<()> {
        self.plans.insert(plan_execution_id.to_string(), Arc::new(plan));
        Ok(())
    }

    async fn get_plan(&self, plan_execution_id: &str) -> Result<Option<Arc<Plan>>> {
        Ok(self.plans.get(plan_execution_id).map(|p| Arc::clone(p.value())))
    }

    async fn insert(&self, execution: PlanExecution) -> Result<bool> {
        match self.executions.entry(execution.uuid.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(execution);
                Ok(true)
            }
        }
    }

    async fn get(&self, plan_execution_id: &str) -> Result<Option<PlanExecution>> {
        Ok(self.executions.get(plan_execution_id).map(|e| e.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        mut execution: PlanExecution,
        expected_version: u64,
    ) -> Result<Option<PlanExecution>> {
        let Some(mut stored) = self.executions.get_mut(&execution.uuid) else {
            return Ok(None);
        };
        if stored.version != expected_version {
            return Ok(None);
        }
        execution.version = expected_version + 1;
        *stored = execution.clone();
        Ok(Some(execution))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Ambiance, Level, PlanNode, Status};
    use crate::store::NodeExecutionStore;
    use chrono::Utc;

    fn node(id: &str, parent: Option<&str>) -> NodeExecution {
        let plan_node = PlanNode::new(format!("setup-{id}"), "T");
        let ambiance = Ambiance::new("pe1", "p1")
            .clone_for_child(Level::for_node(id, &plan_node, 0, Utc::now()));
        NodeExecution::new(ambiance, Utc::now()).with_parent(parent.map(str::to_string))
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = InMemoryNodeExecutionStore::new();
        assert!(store.insert(node("a", None)).await.unwrap());
        assert!(!store.insert(node("a", None)).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_compare_and_swap_bumps_version() {
        let store = InMemoryNodeExecutionStore::new();
        store.insert(node("a", None)).await.unwrap();

        let mut current = store.get("a").await.unwrap().unwrap();
        current.status = Status::Running;
        let stored = store.compare_and_swap(current.clone(), 0).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);

        // Stale version loses.
        current.status = Status::Failed;
        assert!(store.compare_and_swap(current, 0).await.unwrap().is_none());
        assert_eq!(store.get("a").await.unwrap().unwrap().status, Status::Running);
    }

    #[tokio::test]
    async fn test_children_exclude_old_retries() {
        let store = InMemoryNodeExecutionStore::new();
        store.insert(node("p", None)).await.unwrap();
        let mut old = node("c1", Some("p"));
        old.old_retry = true;
        store.insert(old).await.unwrap();
        store.insert(node("c2", Some("p"))).await.unwrap();

        assert_eq!(store.fetch_children("p", true).await.unwrap().len(), 2);
        let latest = store.fetch_children("p", false).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].uuid, "c2");
    }

    #[tokio::test]
    async fn test_count_children_with_status() {
        let store = InMemoryNodeExecutionStore::new();
        store.insert(node("p", None)).await.unwrap();
        let mut done = node("c1", Some("p"));
        done.status = Status::Succeeded;
        store.insert(done).await.unwrap();
        store.insert(node("c2", Some("p"))).await.unwrap();

        let count = store
            .count_children_with_status("p", &[Status::Succeeded, Status::Failed])
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_descendants_and_non_terminal() {
        let store = InMemoryNodeExecutionStore::new();
        store.insert(node("root", None)).await.unwrap();
        store.insert(node("stage", Some("root"))).await.unwrap();
        let mut leaf = node("leaf", Some("stage"));
        leaf.status = Status::Failed;
        store.insert(leaf).await.unwrap();

        let descendants = store.fetch_descendants("root", true).await.unwrap();
        let ids: Vec<&str> = descendants.iter().map(|n| n.uuid.as_str()).collect();
        assert_eq!(ids, vec!["stage", "leaf"]);

        let open = store.fetch_non_terminal("pe1").await.unwrap();
        assert_eq!(open.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_many_updates_indexes() {
        let store = InMemoryNodeExecutionStore::new();
        store.insert(node("p", None)).await.unwrap();
        store.insert(node("c", Some("p"))).await.unwrap();

        let deleted = store.delete_many(&["c".to_string(), "zzz".to_string()]).await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert!(store.fetch_children("p", true).await.unwrap().is_empty());
        assert_eq!(store.fetch_by_plan_execution("pe1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_plan_execution_cas() {
        let store = InMemoryPlanExecutionStore::new();
        let exec = PlanExecution::new(Ambiance::new("pe1", "p1"), Utc::now());
        assert!(store.insert(exec.clone()).await.unwrap());
        assert!(!store.insert(exec.clone()).await.unwrap());

        let mut updated = exec.clone();
        updated.paused = true;
        assert!(store.compare_and_swap(updated.clone(), 0).await.unwrap().is_some());
        assert!(store.compare_and_swap(updated, 0).await.unwrap().is_none());
        assert!(store.get("pe1").await.unwrap().unwrap().paused);
    }
}
