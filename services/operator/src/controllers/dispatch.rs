//! Watch event dispatcher.
//!
//! Fans store change notifications out to the controller work queues:
//!
//! | Event    | Queued                                       |
//! |----------|----------------------------------------------|
//! | build    | the build                                    |
//! | instance | the instance, its allocation queue entry, and its owning build |
//! | workload | the owning instance                          |
//! | node     | the node capacity key                        |
//!
//! Every key is also requeued on a periodic resync, and after the watch
//! stream lags and drops events.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use super::WorkQueue;
use crate::model::ObjectKey;
use crate::store::{ObjectKind, ObjectStore, StoreResult, WatchEvent};

/// Key used for every node capacity pass.
pub fn node_capacity_key() -> ObjectKey {
    ObjectKey::new("", "node-capacity")
}

/// Work queues fed by the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct Queues {
    pub builds: Arc<WorkQueue>,
    pub instances: Arc<WorkQueue>,
    pub nodes: Arc<WorkQueue>,
    /// Allocation queue refresh, keyed by instance.
    pub queue_sync: Arc<WorkQueue>,
}

impl Queues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self) {
        self.builds.shutdown();
        self.instances.shutdown();
        self.nodes.shutdown();
        self.queue_sync.shutdown();
    }

    /// Route one change notification.
    pub fn route(&self, event: &WatchEvent) {
        match event.kind {
            ObjectKind::Build => self.builds.add(event.key.clone()),
            ObjectKind::Instance => {
                self.instances.add(event.key.clone());
                self.queue_sync.add(event.key.clone());
                if let Some(build) = &event.owner {
                    self.builds.add(build.clone());
                }
            }
            ObjectKind::Workload => {
                if let Some(instance) = &event.owner {
                    self.instances.add(instance.clone());
                }
            }
            ObjectKind::Node => self.nodes.add(node_capacity_key()),
        }
    }
}

pub struct Dispatcher {
    store: Arc<dyn ObjectStore>,
    queues: Queues,
    /// Instances the allocation engine wants re-evaluated.
    requeue: mpsc::Receiver<ObjectKey>,
    resync_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        queues: Queues,
        requeue: mpsc::Receiver<ObjectKey>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            store,
            queues,
            requeue,
            resync_interval,
        }
    }

    /// Queue every known object.
    pub async fn resync(&self) -> StoreResult<()> {
        let builds = self.store.list_builds().await?;
        let instances = self.store.list_instances().await?;
        for build in &builds {
            self.queues.builds.add(build.key());
        }
        for instance in &instances {
            self.queues.instances.add(instance.key());
            self.queues.queue_sync.add(instance.key());
        }
        self.queues.nodes.add(node_capacity_key());
        debug!(builds = builds.len(), instances = instances.len(), "Resync queued");
        Ok(())
    }

    async fn resync_or_warn(&self) {
        if let Err(e) = self.resync().await {
            warn!(error = %e, "Resync failed");
        }
    }

    /// Run until shutdown is signaled, then shut the work queues down.
    #[instrument(skip(self, shutdown), name = "dispatcher")]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        // subscribe before listing so nothing falls between the two
        let mut events = self.store.watch();
        self.resync_or_warn().await;
        info!(resync_secs = self.resync_interval.as_secs(), "Starting dispatcher");

        let mut ticker = tokio::time::interval(self.resync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => self.queues.route(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Watch stream lagged, resyncing");
                        self.resync_or_warn().await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Watch stream closed");
                        break;
                    }
                },
                Some(key) = self.requeue.recv() => self.queues.queue_sync.add(key),
                _ = ticker.tick() => self.resync_or_warn().await,
            }
        }

        self.queues.shutdown();
        info!("Dispatcher shut down");
    }
}
