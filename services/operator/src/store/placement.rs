//! Workload placement for the in-process store.
//!
//! Stands in for the cluster scheduler: pending workloads are spread over
//! ready, schedulable nodes in turn.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::{MemoryStore, ObjectStore, StoreResult};

pub struct PlacementWorker {
    store: Arc<MemoryStore>,
    interval: Duration,
    next: AtomicUsize,
}

impl PlacementWorker {
    pub fn new(store: Arc<MemoryStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            next: AtomicUsize::new(0),
        }
    }

    /// Place every pending workload. Returns how many were placed.
    pub async fn place_pending(&self) -> StoreResult<usize> {
        let nodes: Vec<String> = self
            .store
            .list_nodes()
            .await?
            .into_iter()
            .filter(|n| n.ready && n.schedulable)
            .map(|n| n.name)
            .collect();
        if nodes.is_empty() {
            return Ok(0);
        }

        let mut placed = 0;
        for workload in self.store.unscheduled_workloads().await {
            let node = &nodes[self.next.fetch_add(1, Ordering::Relaxed) % nodes.len()];
            match self.store.schedule_workload(&workload.metadata.key(), node).await {
                Ok(_) => {
                    placed += 1;
                    debug!(workload = %workload.metadata.key(), node = %node, "Placed workload");
                }
                // removed since listed
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(placed)
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown), name = "placement_worker")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "Starting placement worker");
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.place_pending().await {
                        warn!(error = %e, "Workload placement failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Placement worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::build::new_instance;
    use crate::model::fixtures::spec;
    use crate::model::{Build, Node, Workload};

    #[tokio::test]
    async fn test_spreads_over_ready_nodes() {
        let store = Arc::new(MemoryStore::new());
        store.add_node(Node::new("node-1", "10.0.0.1")).await;
        store.add_node(Node::new("node-2", "10.0.0.2")).await;
        store.add_node(Node::new("node-3", "10.0.0.3")).await;
        store.set_node_ready("node-3", false).await.unwrap();

        let build = Build::new("default", "build-a", spec(4, 4));
        for i in 0..4 {
            let instance = store
                .create_instance(new_instance(&build, &format!("gs-{i}"), &[]))
                .await
                .unwrap();
            store.create_workload(Workload::for_instance(&instance)).await.unwrap();
        }

        let worker = PlacementWorker::new(store.clone(), Duration::from_millis(10));
        assert_eq!(worker.place_pending().await.unwrap(), 4);
        assert!(store.unscheduled_workloads().await.is_empty());

        let mut per_node = std::collections::BTreeMap::new();
        for i in 0..4 {
            let workload = store
                .get_workload(&crate::model::ObjectKey::new("default", format!("gs-{i}")))
                .await
                .unwrap();
            *per_node.entry(workload.node_name.unwrap()).or_insert(0) += 1;
        }
        assert_eq!(per_node.get("node-1"), Some(&2));
        assert_eq!(per_node.get("node-2"), Some(&2));
    }

    #[tokio::test]
    async fn test_no_nodes_places_nothing() {
        let store = Arc::new(MemoryStore::new());
        let worker = PlacementWorker::new(store, Duration::from_millis(10));
        assert_eq!(worker.place_pending().await.unwrap(), 0);
    }
}
