//! Fleet scaler: build-level reconciliation.
//!
//! Each pass buckets a build's instances by state, cleans up finished and
//! failed instances, creates or deletes instances to converge on the
//! standing-by target without exceeding `max`, and writes a status summary.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_networking::PortRegistry;
use fleet_reconcile::{
    crash_threshold_reached, select_for_deletion, BatchLimits, CrashLedger, DesiredScale,
    Expectations, PopulationCounts, ScalePlan,
};
use rand::distr::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};

use super::{Action, ControllerResult, Reconciler};
use crate::metrics::Metrics;
use crate::model::{
    Build, BuildHealth, BuildStatus, Instance, InstanceHealth, InstanceSpec, InstanceState,
    ObjectKey, ObjectMeta, BUILD_ID_LABEL, BUILD_NAME_LABEL, INSTANCE_FINALIZER,
};
use crate::store::ObjectStore;

/// Retry delay when the port pool cannot cover a create.
const PORT_EXHAUSTED_RETRY: Duration = Duration::from_secs(5);

const NAME_SUFFIX_LEN: usize = 5;

/// Instance name: build name plus a random lowercase suffix.
fn instance_name(build_name: &str) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(NAME_SUFFIX_LEN)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{build_name}-{suffix}")
}

/// New instance of `build` holding `host_ports`, in template port order.
pub(crate) fn new_instance(build: &Build, name: &str, host_ports: &[u16]) -> Instance {
    let mut metadata = ObjectMeta::new(&build.metadata.namespace, name);
    metadata.owner = Some(build.metadata.name.clone());
    metadata
        .labels
        .insert(BUILD_NAME_LABEL.to_string(), build.metadata.name.clone());
    metadata
        .labels
        .insert(BUILD_ID_LABEL.to_string(), build.spec.build_id.to_string());
    metadata.finalizers.push(INSTANCE_FINALIZER.to_string());

    let mut template = build.spec.template.clone();
    let mut ports = host_ports.iter();
    for port in template
        .ports
        .iter_mut()
        .filter(|p| build.spec.ports_to_expose.contains(&p.name))
    {
        let Some(&host_port) = ports.next() else {
            break;
        };
        port.host_port = Some(host_port);
        if template.host_network {
            port.container_port = host_port;
        }
    }

    Instance {
        metadata,
        spec: InstanceSpec {
            build_id: build.spec.build_id,
            template,
            ports_to_expose: build.spec.ports_to_expose.clone(),
        },
        status: Default::default(),
    }
}

/// Build-level reconciler.
pub struct FleetScaler {
    store: Arc<dyn ObjectStore>,
    registry: Arc<PortRegistry>,
    creations: Arc<Expectations>,
    deletions: Arc<Expectations>,
    crashes: Arc<CrashLedger>,
    limits: BatchLimits,
    metrics: Metrics,
}

impl FleetScaler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        registry: Arc<PortRegistry>,
        limits: BatchLimits,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            registry,
            creations: Arc::new(Expectations::new()),
            deletions: Arc::new(Expectations::new()),
            crashes: Arc::new(CrashLedger::new()),
            limits,
            metrics,
        }
    }

    /// Use externally owned expectation sets.
    pub fn with_expectations(mut self, creations: Arc<Expectations>, deletions: Arc<Expectations>) -> Self {
        self.creations = creations;
        self.deletions = deletions;
        self
    }

    fn forget_build(&self, build_key: &str) {
        self.creations.clear(build_key);
        self.deletions.clear(build_key);
        self.crashes.clear_build(build_key);
    }

    /// Create up to `count` instances. Returns false when ports ran out.
    async fn create_instances(&self, build: &Build, count: usize) -> ControllerResult<bool> {
        let build_key = build.key().to_string();
        let namespace = &build.metadata.namespace;
        let ports_needed = build.host_ports_per_instance();

        for _ in 0..count {
            let name = instance_name(&build.metadata.name);
            let ports = match self.registry.reserve(namespace, &name, ports_needed) {
                Ok(ports) => ports,
                Err(e) if e.is_retryable() => {
                    warn!(build = %build_key, error = %e, "Cannot reserve host ports, retrying later");
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            };

            self.creations.expect(&build_key, &name);
            if let Err(e) = self.store.create_instance(new_instance(build, &name, &ports)).await {
                self.creations.forget(&build_key, &name);
                self.registry.release(namespace, &name, &ports);
                return Err(e.into());
            }

            self.metrics.record_created(&build.metadata.name);
            info!(build = %build_key, instance = %name, ports = ?ports, "Created instance");
        }

        self.metrics.set_ports_free(self.registry.free_count());
        Ok(true)
    }

    /// Delete up to `count` non-active instances, pending ones first.
    async fn scale_down(&self, build: &Build, candidates: Vec<&Instance>, count: usize) -> ControllerResult<usize> {
        let build_key = build.key().to_string();
        let victims = select_for_deletion(candidates, count, |i| i.deletion_priority());

        let mut deleted = 0;
        for victim in victims {
            let name = &victim.metadata.name;
            self.deletions.expect(&build_key, name);
            match self
                .store
                .delete_instance(&victim.key(), Some(victim.metadata.resource_version))
                .await
            {
                Ok(()) => {
                    deleted += 1;
                    info!(build = %build_key, instance = %name, state = victim.status.state.as_str(), "Deleted instance on scale down");
                }
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    // changed since listed, most likely allocated
                    self.deletions.forget(&build_key, name);
                    debug!(build = %build_key, instance = %name, error = %e, "Skipped changed instance");
                }
                Err(e) => {
                    self.deletions.forget(&build_key, name);
                    return Err(e.into());
                }
            }
        }
        Ok(deleted)
    }

    /// Delete a finished or failed instance.
    async fn clean_up(&self, build: &Build, instance: &Instance) -> ControllerResult<()> {
        let build_key = build.key().to_string();
        self.deletions.expect(&build_key, &instance.metadata.name);
        match self.store.delete_instance(&instance.key(), None).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                self.deletions.forget(&build_key, &instance.metadata.name);
                Err(e.into())
            }
        }
    }

    fn publish_gauges(&self, build: &Build, counts: &PopulationCounts) {
        let name = &build.metadata.name;
        self.metrics.set_current(name, InstanceState::Pending, counts.pending);
        self.metrics.set_current(name, InstanceState::Initializing, counts.initializing);
        self.metrics.set_current(name, InstanceState::StandingBy, counts.standing_by);
        self.metrics.set_current(name, InstanceState::Active, counts.active);
    }
}

#[async_trait]
impl Reconciler for FleetScaler {
    fn name(&self) -> &'static str {
        "fleet-scaler"
    }

    async fn reconcile(&self, key: &ObjectKey) -> ControllerResult<Action> {
        let build_key = key.to_string();
        let build = match self.store.get_build(key).await {
            Ok(build) => build,
            Err(e) if e.is_not_found() => {
                self.forget_build(&build_key);
                return Ok(Action::Done);
            }
            Err(e) => return Err(e.into()),
        };

        let instances = self.store.list_instances_for_build(key).await?;
        let present: HashSet<&str> = instances.iter().map(|i| i.metadata.name.as_str()).collect();
        self.creations.settle(&build_key, |n| present.contains(n));
        self.deletions.settle(&build_key, |n| !present.contains(n));
        self.crashes.retain_present(&build_key, |n| present.contains(n));

        let mut counts = PopulationCounts::default();
        let mut candidates = Vec::new();
        let mut finished = Vec::new();
        for instance in &instances {
            if instance.metadata.is_deleting() || self.deletions.contains(&build_key, &instance.metadata.name) {
                continue;
            }
            if instance.needs_cleanup() {
                finished.push(instance);
                continue;
            }
            match instance.status.state {
                InstanceState::Pending => counts.pending += 1,
                InstanceState::Initializing => counts.initializing += 1,
                InstanceState::StandingBy => counts.standing_by += 1,
                InstanceState::Active => counts.active += 1,
                InstanceState::GameCompleted | InstanceState::Crashed => {}
            }
            if instance.deletion_priority().is_some() {
                candidates.push(instance);
            }
        }

        // creates not yet visible still count as pending
        let mut planning = counts;
        planning.pending += self.creations.outstanding(&build_key);
        let plan = ScalePlan::compute(
            DesiredScale {
                standing_by: build.spec.standing_by,
                max: build.spec.max,
            },
            planning,
            self.limits,
        );
        if !plan.is_noop() {
            debug!(build = %build_key, to_create = plan.to_create, to_delete = plan.to_delete, ?counts, "Scale plan");
        }

        let mut action = Action::Done;
        if plan.to_create > 0 && !self.create_instances(&build, plan.to_create).await? {
            action = Action::RequeueAfter(PORT_EXHAUSTED_RETRY);
        }
        if plan.to_delete > 0 {
            self.scale_down(&build, candidates, plan.to_delete).await?;
        }

        // crashes are counted once the status write lands
        let new_crashes: Vec<&Instance> = finished
            .iter()
            .copied()
            .filter(|i| i.status.state != InstanceState::GameCompleted)
            .filter(|i| !self.crashes.contains(&build_key, &i.metadata.name))
            .collect();
        let crashes_count = build
            .status
            .crashes_count
            .saturating_add(new_crashes.len() as u32);
        let health = if crash_threshold_reached(crashes_count, build.spec.crashes_to_mark_unhealthy) {
            BuildHealth::Unhealthy
        } else {
            BuildHealth::Healthy
        };
        let status = BuildStatus {
            current_pending: counts.pending,
            current_initializing: counts.initializing,
            current_standing_by: counts.standing_by,
            current_active: counts.active,
            crashes_count,
            health,
            current_standing_by_ready_desired: format!("{}/{}", counts.standing_by, build.spec.standing_by),
        };
        if status != build.status {
            if health != build.status.health {
                warn!(build = %build_key, crashes_count, health = ?health, "Build health changed");
            }
            self.store.patch_build_status(key, status).await?;
        }

        for instance in &new_crashes {
            if self.crashes.record(&build_key, &instance.metadata.name) {
                if instance.status.health == InstanceHealth::Unhealthy {
                    self.metrics.record_unhealthy(&build.metadata.name);
                } else {
                    self.metrics.record_crashed(&build.metadata.name);
                }
            }
        }
        for instance in finished {
            self.clean_up(&build, instance).await?;
            if instance.status.state == InstanceState::GameCompleted {
                self.metrics.record_session_ended(&build.metadata.name);
            }
            info!(
                build = %build_key,
                instance = %instance.metadata.name,
                state = instance.status.state.as_str(),
                health = ?instance.status.health,
                "Cleaned up instance"
            );
        }

        self.publish_gauges(&build, &counts);
        Ok(action)
    }
}
