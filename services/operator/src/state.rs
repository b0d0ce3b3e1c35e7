//! Application state shared across request handlers.

use std::sync::Arc;
use std::time::Duration;

use fleet_networking::PortRegistry;

use crate::allocation::{AllocationEngine, InstanceQueue};
use crate::metrics::Metrics;
use crate::store::ObjectStore;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<dyn ObjectStore>,
    engine: AllocationEngine,
    registry: Arc<PortRegistry>,
    queue: Arc<InstanceQueue>,
    metrics: Metrics,
    allocation_timeout: Duration,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        engine: AllocationEngine,
        registry: Arc<PortRegistry>,
        queue: Arc<InstanceQueue>,
        metrics: Metrics,
        allocation_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                store,
                engine,
                registry,
                queue,
                metrics,
                allocation_timeout,
            }),
        }
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.inner.store.as_ref()
    }

    pub fn engine(&self) -> &AllocationEngine {
        &self.inner.engine
    }

    pub fn registry(&self) -> &PortRegistry {
        &self.inner.registry
    }

    pub fn queue(&self) -> &InstanceQueue {
        &self.inner.queue
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Upper bound on one allocation request.
    pub fn allocation_timeout(&self) -> Duration {
        self.inner.allocation_timeout
    }
}
