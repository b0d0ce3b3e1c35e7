//! Node membership: keeps port capacity in step with the node pool.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_networking::PortRegistry;
use tracing::info;

use super::{Action, ControllerResult, Reconciler};
use crate::metrics::Metrics;
use crate::model::ObjectKey;
use crate::store::ObjectStore;

/// Recounts eligible nodes on every node change. The key is ignored; every
/// pass looks at the whole pool.
pub struct NodeReconciler {
    store: Arc<dyn ObjectStore>,
    registry: Arc<PortRegistry>,
    game_server_nodes_only: bool,
    metrics: Metrics,
}

impl NodeReconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        registry: Arc<PortRegistry>,
        game_server_nodes_only: bool,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            registry,
            game_server_nodes_only,
            metrics,
        }
    }

    /// Count eligible nodes and resize the registry. Returns the new count.
    pub async fn sync(&self) -> ControllerResult<usize> {
        let eligible = self
            .store
            .list_nodes()
            .await?
            .iter()
            .filter(|n| n.is_eligible(self.game_server_nodes_only))
            .count();

        let previous = self.registry.set_node_count(eligible);
        if previous != eligible {
            info!(previous, nodes = eligible, free_ports = self.registry.free_count(), "Node capacity changed");
        }
        self.metrics.set_nodes(eligible);
        self.metrics.set_ports_free(self.registry.free_count());
        Ok(eligible)
    }
}

#[async_trait]
impl Reconciler for NodeReconciler {
    fn name(&self) -> &'static str {
        "node-capacity"
    }

    async fn reconcile(&self, _key: &ObjectKey) -> ControllerResult<Action> {
        self.sync().await?;
        Ok(Action::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics;
    use crate::model::{Node, GAME_SERVER_NODE_LABEL};
    use crate::store::MemoryStore;

    fn reconciler(store: Arc<MemoryStore>, registry: Arc<PortRegistry>, only_labelled: bool) -> NodeReconciler {
        NodeReconciler::new(store, registry, only_labelled, metrics::init().unwrap())
    }

    #[tokio::test]
    async fn test_capacity_tracks_ready_nodes() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(PortRegistry::new(10000, 10009, 0).unwrap());
        let nodes = reconciler(store.clone(), registry.clone(), false);

        store.add_node(Node::new("node-1", "10.0.0.1")).await;
        store.add_node(Node::new("node-2", "10.0.0.2")).await;
        assert_eq!(nodes.sync().await.unwrap(), 2);
        assert_eq!(registry.free_count(), 20);

        store.set_node_ready("node-2", false).await.unwrap();
        assert_eq!(nodes.sync().await.unwrap(), 1);
        assert_eq!(registry.free_count(), 10);
    }

    #[tokio::test]
    async fn test_removed_node_keeps_held_ports() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(PortRegistry::new(10000, 10009, 0).unwrap());
        let nodes = reconciler(store.clone(), registry.clone(), false);

        store.add_node(Node::new("node-1", "10.0.0.1")).await;
        store.add_node(Node::new("node-2", "10.0.0.2")).await;
        nodes.sync().await.unwrap();
        let held = registry.reserve("default", "gs-1", 3).unwrap();

        store.remove_node("node-2").await.unwrap();
        nodes.sync().await.unwrap();
        for port in held {
            assert_eq!(registry.holders(port), 1);
        }
        assert_eq!(registry.free_count(), 7);
    }

    #[tokio::test]
    async fn test_only_labelled_nodes_count() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(PortRegistry::new(10000, 10009, 0).unwrap());
        let nodes = reconciler(store.clone(), registry.clone(), true);

        let mut labelled = Node::new("gs-node", "10.0.0.1");
        labelled
            .labels
            .insert(GAME_SERVER_NODE_LABEL.to_string(), "true".to_string());
        store.add_node(labelled).await;
        store.add_node(Node::new("system-node", "10.0.0.2")).await;

        assert_eq!(nodes.sync().await.unwrap(), 1);
    }
}
