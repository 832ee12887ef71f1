//! Rollback information: the failed leaves under a node.
//!
//! When a section fails under a rollback adviser, the aggregator walks the
//! node's children through the store and collects the plan node ids of the
//! steps that actually failed. A failed child container contributes its
//! own published aggregate (or is walked in turn), never its own id.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::core::NodeExecution;
use crate::errors::{EngineError, Result};
use crate::store::{NodeDeleteObserver, NodeExecutionStore};

/// The aggregate published for a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackInfo {
    /// Node the aggregate was computed for.
    pub node_execution_id: String,
    /// Plan node ids of failed leaves, sorted.
    pub failed_node_ids: Vec<String>,
}

/// Storage for published rollback aggregates.
#[async_trait]
pub trait RollbackOutputStore: Send + Sync {
    /// Publishes (or replaces) an aggregate.
    async fn publish(&self, info: RollbackInfo) -> Result<()>;

    /// Reads the aggregate of a node.
    async fn get(&self, node_execution_id: &str) -> Result<Option<RollbackInfo>>;

    /// Deletes aggregates of the given nodes.
    async fn delete(&self, node_execution_ids: &[String]) -> Result<usize>;
}

/// Aggregates in a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryRollbackOutputStore {
    outputs: DashMap<String, RollbackInfo>,
}

impl InMemoryRollbackOutputStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RollbackOutputStore for InMemoryRollbackOutputStore {
    async fn publish(&self, info: RollbackInfo) -> Result<()> {
        self.outputs.insert(info.node_execution_id.clone(), info);
        Ok(())
    }

    async fn get(&self, node_execution_id: &str) -> Result<Option<RollbackInfo>> {
        Ok(self.outputs.get(node_execution_id).map(|o| o.value().clone()))
    }

    async fn delete(&self, node_execution_ids: &[String]) -> Result<usize> {
        Ok(node_execution_ids
            .iter()
            .filter(|id| self.outputs.remove(*id).is_some())
            .count())
    }
}

/// Computes and publishes failed-leaf sets.
pub struct RollbackAggregator {
    nodes: Arc<dyn NodeExecutionStore>,
    outputs: Arc<dyn RollbackOutputStore>,
}

impl std::fmt::Debug for RollbackAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackAggregator").finish_non_exhaustive()
    }
}

impl RollbackAggregator {
    /// Creates an aggregator.
    #[must_use]
    pub fn new(nodes: Arc<dyn NodeExecutionStore>, outputs: Arc<dyn RollbackOutputStore>) -> Self {
        Self { nodes, outputs }
    }

    /// Computes the failed leaves under `node_execution_id`, publishes them
    /// as the node's aggregate and returns it.
    pub async fn publish_rollback_information(&self, node_execution_id: &str) -> Result<RollbackInfo> {
        let root = self
            .nodes
            .get(node_execution_id)
            .await?
            .ok_or_else(|| EngineError::not_found("node execution", node_execution_id))?;

        let mut failed = BTreeSet::new();
        let mut saw_children = false;
        let mut stack = vec![root.uuid.clone()];

        while let Some(id) = stack.pop() {
            for child in self.nodes.fetch_children(&id, false).await? {
                saw_children = true;
                if !child.status.is_broken() {
                    continue;
                }
                if let Some(published) = self.outputs.get(&child.uuid).await? {
                    failed.extend(published.failed_node_ids);
                } else if child.is_parent() {
                    stack.push(child.uuid.clone());
                } else {
                    failed.insert(child.plan_node_id.clone());
                }
            }
        }

        if !saw_children && root.status.is_broken() {
            failed.insert(root.plan_node_id.clone());
        }

        let info = RollbackInfo {
            node_execution_id: root.uuid.clone(),
            failed_node_ids: failed.into_iter().collect(),
        };
        debug!(
            node_execution_id = %info.node_execution_id,
            failed = ?info.failed_node_ids,
            "Published rollback information"
        );
        self.outputs.publish(info.clone()).await?;
        Ok(info)
    }

    /// Reads a published aggregate.
    pub async fn get(&self, node_execution_id: &str) -> Result<Option<RollbackInfo>> {
        self.outputs.get(node_execution_id).await
    }
}

#[async_trait]
impl NodeDeleteObserver for RollbackAggregator {
    async fn on_nodes_delete(&self, nodes: &[NodeExecution]) -> Result<()> {
        let ids: Vec<String> = nodes.iter().map(|n| n.uuid.clone()).collect();
        self.outputs.delete(&ids).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Ambiance, ExecutionMode, Level, PlanNode, Status};
    use crate::store::InMemoryNodeExecutionStore;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    struct Tree {
        store: Arc<InMemoryNodeExecutionStore>,
    }

    impl Tree {
        async fn add(
            &self,
            id: &str,
            plan_node: &str,
            parent: Option<&NodeExecution>,
            status: Status,
            mode: ExecutionMode,
        ) -> NodeExecution {
            let base = parent.map_or_else(|| Ambiance::new("pe", "p"), |p| p.ambiance.clone());
            let level = Level::for_node(id, &PlanNode::new(plan_node, "T"), 0, Utc::now());
            let mut node = NodeExecution::new(base.clone_for_child(level), Utc::now())
                .with_parent(parent.map(|p| p.uuid.clone()));
            node.status = status;
            node.mode = Some(mode);
            self.store.insert(node.clone()).await.unwrap();
            node
        }
    }

    fn aggregator(tree: &Tree) -> RollbackAggregator {
        RollbackAggregator::new(tree.store.clone(), Arc::new(InMemoryRollbackOutputStore::new()))
    }

    #[tokio::test]
    async fn test_nested_failure_yields_single_leaf() {
        let tree = Tree {
            store: Arc::new(InMemoryNodeExecutionStore::new()),
        };
        let pipeline = tree
            .add("rt-p", "pipeline", None, Status::Failed, ExecutionMode::Child)
            .await;
        let stage = tree
            .add("rt-s", "stage", Some(&pipeline), Status::Failed, ExecutionMode::Child)
            .await;
        let fork = tree
            .add("rt-f", "fork", Some(&stage), Status::Failed, ExecutionMode::Children)
            .await;
        tree.add("rt-a", "a", Some(&fork), Status::Succeeded, ExecutionMode::Sync).await;
        tree.add("rt-b", "b", Some(&fork), Status::Failed, ExecutionMode::Sync).await;
        tree.add("rt-c", "c", Some(&fork), Status::Succeeded, ExecutionMode::Sync).await;

        let info = aggregator(&tree).publish_rollback_information("rt-p").await.unwrap();
        assert_eq!(info.failed_node_ids, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_published_child_aggregate_is_reused() {
        let tree = Tree {
            store: Arc::new(InMemoryNodeExecutionStore::new()),
        };
        let stage = tree
            .add("rt-s", "stage", None, Status::Failed, ExecutionMode::Child)
            .await;
        let group = tree
            .add("rt-g", "group", Some(&stage), Status::Failed, ExecutionMode::Children)
            .await;
        tree.add("rt-x", "x", Some(&group), Status::Errored, ExecutionMode::Sync).await;

        let agg = aggregator(&tree);
        agg.outputs
            .publish(RollbackInfo {
                node_execution_id: "rt-g".into(),
                failed_node_ids: vec!["x".into(), "y".into()],
            })
            .await
            .unwrap();

        let info = agg.publish_rollback_information("rt-s").await.unwrap();
        assert_eq!(info.failed_node_ids, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(agg.get("rt-s").await.unwrap().unwrap(), info);
    }

    #[tokio::test]
    async fn test_failed_leaf_reports_itself() {
        let tree = Tree {
            store: Arc::new(InMemoryNodeExecutionStore::new()),
        };
        tree.add("rt-a", "a", None, Status::Failed, ExecutionMode::Sync).await;

        let agg = aggregator(&tree);
        let info = agg.publish_rollback_information("rt-a").await.unwrap();
        assert_eq!(info.failed_node_ids, vec!["a".to_string()]);

        let node = tree.store.get("rt-a").await.unwrap().unwrap();
        agg.on_nodes_delete(&[node]).await.unwrap();
        assert!(agg.get("rt-a").await.unwrap().is_none());
    }
}
