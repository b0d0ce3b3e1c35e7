//! Instance lifecycle controller.
//!
//! Keeps each instance paired with exactly one workload, turns process exit
//! into a terminal state, publishes the address players connect to, and
//! releases host ports through a finalizer before the instance disappears.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleet_networking::PortRegistry;
use fleet_reconcile::Expectations;
use tracing::{debug, info, warn};

use super::{Action, ControllerResult, Reconciler};
use crate::metrics::Metrics;
use crate::model::{
    Instance, InstanceState, InstanceStatusPatch, ObjectKey, Workload, INSTANCE_FINALIZER,
    SAFE_TO_EVICT_ANNOTATION,
};
use crate::store::{ObjectStore, StoreError};

/// Retry delay while the hosting node is not yet visible.
const NODE_RETRY: Duration = Duration::from_secs(2);

pub struct InstanceLifecycleController {
    store: Arc<dyn ObjectStore>,
    registry: Arc<PortRegistry>,
    /// Workload creates issued but not yet observed.
    workloads: Arc<Expectations>,
    metrics: Metrics,
}

impl InstanceLifecycleController {
    pub fn new(store: Arc<dyn ObjectStore>, registry: Arc<PortRegistry>, metrics: Metrics) -> Self {
        Self {
            store,
            registry,
            workloads: Arc::new(Expectations::new()),
            metrics,
        }
    }

    pub fn with_expectations(mut self, workloads: Arc<Expectations>) -> Self {
        self.workloads = workloads;
        self
    }

    /// Release ports, then drop the finalizer so the store can remove it.
    async fn finalize(&self, instance: &Instance) -> ControllerResult<()> {
        let ns = &instance.metadata.namespace;
        let name = &instance.metadata.name;

        let released = self.registry.release_owner(ns, name);
        self.metrics.set_ports_free(self.registry.free_count());

        let finalizers = instance
            .metadata
            .finalizers
            .iter()
            .filter(|f| *f != INSTANCE_FINALIZER)
            .cloned()
            .collect();
        match self.store.set_instance_finalizers(&instance.key(), finalizers).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        self.metrics
            .record_deleted(instance.metadata.owner.as_deref().unwrap_or_default());
        info!(instance = %instance.key(), ports = ?released, "Released instance");
        Ok(())
    }

    /// Create the workload unless a create is already in flight.
    async fn ensure_workload(&self, instance: &Instance) -> ControllerResult<()> {
        let key = instance.key().to_string();
        let name = &instance.metadata.name;
        if self.workloads.contains(&key, name) {
            debug!(instance = %key, "Workload create in flight");
            return Ok(());
        }

        self.workloads.expect(&key, name);
        match self.store.create_workload(Workload::for_instance(instance)).await {
            Ok(_) => {
                info!(instance = %key, "Created workload");
                Ok(())
            }
            Err(StoreError::AlreadyExists { .. }) => Ok(()),
            Err(e) => {
                self.workloads.forget(&key, name);
                Err(e.into())
            }
        }
    }

    /// Mark the workload evictable only while nobody is playing on it.
    async fn sync_eviction(&self, instance: &Instance, workload: &Workload) -> ControllerResult<()> {
        let desired = match instance.status.state {
            InstanceState::StandingBy if workload.annotation(SAFE_TO_EVICT_ANNOTATION).is_none() => "true",
            InstanceState::Active if workload.annotation(SAFE_TO_EVICT_ANNOTATION) != Some("false") => "false",
            _ => return Ok(()),
        };
        self.store
            .set_workload_annotation(&workload.metadata.key(), SAFE_TO_EVICT_ANNOTATION, desired)
            .await?;
        debug!(instance = %instance.key(), safe_to_evict = desired, "Updated eviction annotation");
        Ok(())
    }

    /// Publish address, node, and ports once the workload has a node.
    async fn publish_address(&self, instance: &Instance, node_name: &str) -> ControllerResult<Action> {
        let node = match self.store.get_node(node_name).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() => {
                warn!(instance = %instance.key(), node = node_name, "Hosting node not found");
                return Ok(Action::RequeueAfter(NODE_RETRY));
            }
            Err(e) => return Err(e.into()),
        };
        let Some(ip) = node.public_ip() else {
            warn!(instance = %instance.key(), node = node_name, "Hosting node has no address");
            return Ok(Action::RequeueAfter(NODE_RETRY));
        };

        let patch = InstanceStatusPatch {
            public_ip: Some(ip.to_string()),
            node_name: Some(node.name.clone()),
            node_age: Some(node.age_days(Utc::now())),
            ports: Some(instance.ports_string()),
            ..Default::default()
        };
        self.store
            .patch_instance_status(&instance.key(), patch, None)
            .await?;
        info!(instance = %instance.key(), node = node_name, ip, "Instance scheduled");
        Ok(Action::Done)
    }
}

#[async_trait]
impl Reconciler for InstanceLifecycleController {
    fn name(&self) -> &'static str {
        "instance-lifecycle"
    }

    async fn reconcile(&self, key: &ObjectKey) -> ControllerResult<Action> {
        let expectation_key = key.to_string();
        let mut instance = match self.store.get_instance(key).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => {
                self.workloads.clear(&expectation_key);
                return Ok(Action::Done);
            }
            Err(e) => return Err(e.into()),
        };

        if instance.metadata.is_deleting() {
            if instance.metadata.has_finalizer(INSTANCE_FINALIZER) {
                self.finalize(&instance).await?;
            }
            self.workloads.clear(&expectation_key);
            return Ok(Action::Done);
        }

        if !instance.metadata.has_finalizer(INSTANCE_FINALIZER) {
            let mut finalizers = instance.metadata.finalizers.clone();
            finalizers.push(INSTANCE_FINALIZER.to_string());
            instance = self.store.set_instance_finalizers(key, finalizers).await?;
        }

        let workload = match self.store.get_workload(key).await {
            Ok(workload) => workload,
            Err(e) if e.is_not_found() => {
                if !instance.status.state.is_terminal() {
                    self.ensure_workload(&instance).await?;
                }
                return Ok(Action::Done);
            }
            Err(e) => return Err(e.into()),
        };
        self.workloads.forget(&expectation_key, &instance.metadata.name);

        if instance.status.state.is_terminal() {
            return Ok(Action::Done);
        }

        if let Some(exit_code) = workload.exit_code() {
            let state = if exit_code == 0 {
                InstanceState::GameCompleted
            } else {
                InstanceState::Crashed
            };
            self.store
                .patch_instance_status(key, InstanceStatusPatch::state(state), None)
                .await?;
            if exit_code == 0 {
                info!(instance = %key, "Game session completed");
            } else {
                warn!(instance = %key, exit_code, previous = instance.status.state.as_str(), "Instance crashed");
            }
            return Ok(Action::Done);
        }

        self.sync_eviction(&instance, &workload).await?;

        match workload.node_name.as_deref() {
            Some(node_name) if instance.status.public_ip.is_none() => {
                self.publish_address(&instance, node_name).await
            }
            _ => Ok(Action::Done),
        }
    }
}
