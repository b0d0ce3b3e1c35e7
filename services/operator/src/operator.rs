//! Operator assembly.
//!
//! Wires the store, port registry, allocation queue and controllers
//! together and runs them until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_networking::PortRegistry;
use fleet_reconcile::BatchLimits;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::allocation::{AllocationEngine, InstanceQueue, QueueSyncReconciler, REQUEUE_CAPACITY};
use crate::config::Config;
use crate::controllers::{
    Controller, ControllerConfig, Dispatcher, FleetScaler, InstanceLifecycleController, NodeReconciler, Queues,
};
use crate::metrics::Metrics;
use crate::state::AppState;
use crate::store::ObjectStore;

/// A running operator: its shared state and the background tasks behind it.
pub struct Operator {
    state: AppState,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Operator {
    /// Recover port holdings from the store, then start the dispatcher and
    /// every controller. Tasks stop when `shutdown` flips to true.
    pub async fn start(
        config: &Config,
        store: Arc<dyn ObjectStore>,
        metrics: Metrics,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let nodes = store
            .list_nodes()
            .await
            .context("failed to list nodes")?
            .iter()
            .filter(|n| n.is_eligible(config.game_server_nodes_only))
            .count();
        let registry = Arc::new(
            PortRegistry::new(config.min_port, config.max_port, nodes).context("invalid port range")?,
        );

        let instances = store.list_instances().await.context("failed to list instances")?;
        let mut recovered = 0;
        for instance in &instances {
            let ports = instance.host_ports();
            if ports.is_empty() {
                continue;
            }
            match registry.register_existing(&instance.metadata.namespace, &instance.metadata.name, &ports) {
                Ok(()) => recovered += ports.len(),
                Err(e) => warn!(instance = %instance.key(), error = %e, "Failed to recover instance ports"),
            }
        }
        metrics.set_nodes(nodes);
        metrics.set_ports_free(registry.free_count());
        info!(
            nodes,
            instances = instances.len(),
            recovered_ports = recovered,
            free_ports = registry.free_count(),
            "Port registry initialized"
        );

        let queue = Arc::new(InstanceQueue::new());
        let (requeue_tx, requeue_rx) = mpsc::channel(REQUEUE_CAPACITY);
        let engine = AllocationEngine::new(
            store.clone(),
            queue.clone(),
            requeue_tx,
            metrics.clone(),
            config.allocation_attempts,
        );

        let queues = Queues::new();
        let dispatcher = Dispatcher::new(store.clone(), queues.clone(), requeue_rx, config.resync_interval);

        let workers = ControllerConfig {
            workers: config.reconcile_workers,
            pass_timeout: config.pass_timeout,
        };
        let limits = BatchLimits {
            max_create: config.max_create_per_pass,
            max_delete: config.max_delete_per_pass,
        };

        let scaler = Controller::new(
            FleetScaler::new(store.clone(), registry.clone(), limits, metrics.clone()),
            queues.builds.clone(),
            workers,
        );
        let lifecycle = Controller::new(
            InstanceLifecycleController::new(store.clone(), registry.clone(), metrics.clone()),
            queues.instances.clone(),
            workers,
        );
        // one pass recounts the whole pool
        let node_capacity = Controller::new(
            NodeReconciler::new(
                store.clone(),
                registry.clone(),
                config.game_server_nodes_only,
                metrics.clone(),
            ),
            queues.nodes.clone(),
            ControllerConfig { workers: 1, ..workers },
        );
        let queue_sync = Controller::new(
            QueueSyncReconciler::new(store.clone(), queue.clone()),
            queues.queue_sync.clone(),
            workers,
        );

        let handles = vec![
            ("dispatcher", tokio::spawn(dispatcher.run(shutdown.clone()))),
            ("fleet-scaler", tokio::spawn(scaler.run(shutdown.clone()))),
            ("instance-lifecycle", tokio::spawn(lifecycle.run(shutdown.clone()))),
            ("node-capacity", tokio::spawn(node_capacity.run(shutdown.clone()))),
            ("allocation-queue", tokio::spawn(queue_sync.run(shutdown))),
        ];

        let state = AppState::new(store, engine, registry, queue, metrics, config.allocation_timeout);
        info!(workers = config.reconcile_workers, "Operator started");
        Ok(Self { state, handles })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Wait for every task to stop, giving each up to `timeout`.
    pub async fn join(self, timeout: Duration) {
        for (name, handle) in self.handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = name, error = %e, "Operator task panicked"),
                Err(_) => warn!(task = name, "Operator task did not shut down in time"),
            }
        }
        info!("Operator stopped");
    }
}
