//! In-process object store.
//!
//! Holds every object in ordered maps behind a single lock and assigns
//! resource versions from one store-wide counter. Besides the
//! [`ObjectStore`] API it exposes the actions a cluster runtime would take
//! on its own: node membership, workload placement, and process exit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use fleet_id::{BuildId, SessionId};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::{ObjectKind, ObjectStore, StoreError, StoreResult, WatchAction, WatchEvent};
use crate::model::{
    validate_build_spec, validate_build_update, Build, BuildSpec, BuildStatus, Instance,
    InstanceStatusPatch, Node, ObjectKey, ValidationError, Workload, WorkloadPhase,
};

const WATCH_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Objects {
    version: u64,
    builds: BTreeMap<ObjectKey, Build>,
    instances: BTreeMap<ObjectKey, Instance>,
    workloads: BTreeMap<ObjectKey, Workload>,
    nodes: BTreeMap<String, Node>,
}

impl Objects {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    /// Delete or mark for deletion, depending on finalizers.
    fn delete_instance(
        &mut self,
        key: &ObjectKey,
        precondition: Option<u64>,
        events: &mut Vec<WatchEvent>,
    ) -> StoreResult<()> {
        let version = self.next_version();
        let instance = self
            .instances
            .get_mut(key)
            .ok_or_else(|| StoreError::not_found(ObjectKind::Instance, key))?;
        check_precondition(ObjectKind::Instance, key, instance.metadata.resource_version, precondition)?;

        if instance.metadata.finalizers.is_empty() {
            self.remove_instance(key, events);
            return Ok(());
        }

        if instance.metadata.deletion_timestamp.is_none() {
            instance.metadata.deletion_timestamp = Some(Utc::now());
            instance.metadata.resource_version = version;
            events.push(instance_event(instance, WatchAction::Applied));
        }
        Ok(())
    }

    /// Physically remove an instance and its workload.
    fn remove_instance(&mut self, key: &ObjectKey, events: &mut Vec<WatchEvent>) {
        if let Some(workload) = self.workloads.remove(key) {
            events.push(workload_event(&workload, WatchAction::Deleted));
        }
        if let Some(instance) = self.instances.remove(key) {
            events.push(instance_event(&instance, WatchAction::Deleted));
        }
    }
}

fn check_precondition(kind: ObjectKind, key: &ObjectKey, actual: u64, expected: Option<u64>) -> StoreResult<()> {
    match expected {
        Some(expected) if expected != actual => Err(StoreError::Conflict {
            kind,
            key: key.to_string(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

fn invalid(kind: ObjectKind, key: &ObjectKey, errors: Vec<ValidationError>) -> StoreError {
    StoreError::Invalid {
        kind,
        key: key.to_string(),
        message: errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; "),
    }
}

fn build_event(key: ObjectKey, action: WatchAction) -> WatchEvent {
    WatchEvent {
        kind: ObjectKind::Build,
        action,
        key,
        owner: None,
    }
}

fn instance_event(instance: &Instance, action: WatchAction) -> WatchEvent {
    WatchEvent {
        kind: ObjectKind::Instance,
        action,
        key: instance.key(),
        owner: instance.build_key(),
    }
}

fn workload_event(workload: &Workload, action: WatchAction) -> WatchEvent {
    WatchEvent {
        kind: ObjectKind::Workload,
        action,
        key: workload.metadata.key(),
        owner: workload.metadata.owner_key(),
    }
}

fn node_event(name: &str, action: WatchAction) -> WatchEvent {
    WatchEvent {
        kind: ObjectKind::Node,
        action,
        key: ObjectKey::new("", name),
        owner: None,
    }
}

/// In-memory [`ObjectStore`].
#[derive(Debug)]
pub struct MemoryStore {
    objects: RwLock<Objects>,
    events: broadcast::Sender<WatchEvent>,
    fail_writes: AtomicBool,
    failing_writes: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            objects: RwLock::new(Objects::default()),
            events,
            fail_writes: AtomicBool::new(false),
            failing_writes: AtomicUsize::new(0),
        }
    }

    /// Make every subsequent write through [`ObjectStore`] fail with
    /// [`StoreError::Backend`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail only the next `count` writes.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StoreResult<()> {
        let transient = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient || self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("writes are failing".to_string()));
        }
        Ok(())
    }

    fn publish(&self, events: Vec<WatchEvent>) {
        for event in events {
            // no subscribers is fine
            let _ = self.events.send(event);
        }
    }

    // =========================================================================
    // Runtime actions
    // =========================================================================

    /// Add or replace a node.
    pub async fn add_node(&self, node: Node) {
        let name = node.name.clone();
        self.objects.write().await.nodes.insert(name.clone(), node);
        debug!(node = %name, "node added");
        self.publish(vec![node_event(&name, WatchAction::Applied)]);
    }

    pub async fn remove_node(&self, name: &str) -> StoreResult<()> {
        self.objects
            .write()
            .await
            .nodes
            .remove(name)
            .ok_or_else(|| StoreError::not_found(ObjectKind::Node, name))?;
        self.publish(vec![node_event(name, WatchAction::Deleted)]);
        Ok(())
    }

    pub async fn set_node_ready(&self, name: &str, ready: bool) -> StoreResult<()> {
        {
            let mut objects = self.objects.write().await;
            let node = objects
                .nodes
                .get_mut(name)
                .ok_or_else(|| StoreError::not_found(ObjectKind::Node, name))?;
            node.ready = ready;
        }
        self.publish(vec![node_event(name, WatchAction::Applied)]);
        Ok(())
    }

    /// Workloads not yet placed on a node.
    pub async fn unscheduled_workloads(&self) -> Vec<Workload> {
        self.objects
            .read()
            .await
            .workloads
            .values()
            .filter(|w| w.node_name.is_none())
            .cloned()
            .collect()
    }

    /// Place a workload on a node and start it.
    pub async fn schedule_workload(&self, key: &ObjectKey, node_name: &str) -> StoreResult<Workload> {
        let workload = {
            let mut objects = self.objects.write().await;
            if !objects.nodes.contains_key(node_name) {
                return Err(StoreError::not_found(ObjectKind::Node, node_name));
            }
            let version = objects.next_version();
            let workload = objects
                .workloads
                .get_mut(key)
                .ok_or_else(|| StoreError::not_found(ObjectKind::Workload, key))?;
            workload.node_name = Some(node_name.to_string());
            workload.phase = WorkloadPhase::Running;
            workload.metadata.resource_version = version;
            workload.clone()
        };
        self.publish(vec![workload_event(&workload, WatchAction::Applied)]);
        Ok(workload)
    }

    /// Record that the workload's process exited.
    pub async fn terminate_workload(&self, key: &ObjectKey, exit_code: i32) -> StoreResult<Workload> {
        let workload = {
            let mut objects = self.objects.write().await;
            let version = objects.next_version();
            let workload = objects
                .workloads
                .get_mut(key)
                .ok_or_else(|| StoreError::not_found(ObjectKind::Workload, key))?;
            workload.phase = WorkloadPhase::Exited { exit_code };
            workload.metadata.resource_version = version;
            workload.clone()
        };
        self.publish(vec![workload_event(&workload, WatchAction::Applied)]);
        Ok(workload)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_build(&self, key: &ObjectKey) -> StoreResult<Build> {
        self.objects
            .read()
            .await
            .builds
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(ObjectKind::Build, key))
    }

    async fn list_builds(&self) -> StoreResult<Vec<Build>> {
        Ok(self.objects.read().await.builds.values().cloned().collect())
    }

    async fn find_build_by_id(&self, build_id: BuildId) -> StoreResult<Option<Build>> {
        Ok(self
            .objects
            .read()
            .await
            .builds
            .values()
            .find(|b| b.spec.build_id == build_id)
            .cloned())
    }

    async fn create_build(&self, mut build: Build) -> StoreResult<Build> {
        self.check_writable()?;
        let key = build.key();
        validate_build_spec(&build.spec).map_err(|e| invalid(ObjectKind::Build, &key, e))?;

        let mut objects = self.objects.write().await;
        if objects.builds.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: ObjectKind::Build,
                key: key.to_string(),
            });
        }
        if let Some(other) = objects
            .builds
            .values()
            .find(|b| b.spec.build_id == build.spec.build_id)
        {
            return Err(invalid(
                ObjectKind::Build,
                &key,
                vec![ValidationError::new(
                    "spec.buildID",
                    format!("buildID {} is already used by {}", build.spec.build_id, other.key()),
                )],
            ));
        }

        build.metadata.resource_version = objects.next_version();
        build.metadata.created_at = Utc::now();
        objects.builds.insert(key.clone(), build.clone());
        drop(objects);

        self.publish(vec![build_event(key, WatchAction::Applied)]);
        Ok(build)
    }

    async fn update_build_spec(
        &self,
        key: &ObjectKey,
        spec: BuildSpec,
        precondition: Option<u64>,
    ) -> StoreResult<Build> {
        self.check_writable()?;
        let mut objects = self.objects.write().await;
        let version = objects.next_version();
        let build = objects
            .builds
            .get_mut(key)
            .ok_or_else(|| StoreError::not_found(ObjectKind::Build, key))?;
        check_precondition(ObjectKind::Build, key, build.metadata.resource_version, precondition)?;
        validate_build_update(&build.spec, &spec).map_err(|e| invalid(ObjectKind::Build, key, e))?;

        build.spec = spec;
        build.metadata.resource_version = version;
        let build = build.clone();
        drop(objects);

        self.publish(vec![build_event(key.clone(), WatchAction::Applied)]);
        Ok(build)
    }

    async fn patch_build_status(&self, key: &ObjectKey, status: BuildStatus) -> StoreResult<Build> {
        self.check_writable()?;
        let mut objects = self.objects.write().await;
        let version = objects.next_version();
        let build = objects
            .builds
            .get_mut(key)
            .ok_or_else(|| StoreError::not_found(ObjectKind::Build, key))?;
        build.status = status;
        build.metadata.resource_version = version;
        let build = build.clone();
        drop(objects);

        self.publish(vec![build_event(key.clone(), WatchAction::Applied)]);
        Ok(build)
    }

    async fn delete_build(&self, key: &ObjectKey) -> StoreResult<()> {
        self.check_writable()?;
        let mut events = Vec::new();
        {
            let mut objects = self.objects.write().await;
            objects
                .builds
                .remove(key)
                .ok_or_else(|| StoreError::not_found(ObjectKind::Build, key))?;

            let owned: Vec<ObjectKey> = objects
                .instances
                .values()
                .filter(|i| i.build_key().as_ref() == Some(key))
                .map(Instance::key)
                .collect();
            for instance in owned {
                objects.delete_instance(&instance, None, &mut events)?;
            }
            events.push(build_event(key.clone(), WatchAction::Deleted));
        }
        self.publish(events);
        Ok(())
    }

    async fn get_instance(&self, key: &ObjectKey) -> StoreResult<Instance> {
        self.objects
            .read()
            .await
            .instances
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(ObjectKind::Instance, key))
    }

    async fn list_instances(&self) -> StoreResult<Vec<Instance>> {
        Ok(self.objects.read().await.instances.values().cloned().collect())
    }

    async fn list_instances_for_build(&self, build: &ObjectKey) -> StoreResult<Vec<Instance>> {
        Ok(self
            .objects
            .read()
            .await
            .instances
            .values()
            .filter(|i| i.build_key().as_ref() == Some(build))
            .cloned()
            .collect())
    }

    async fn find_instances_by_session(
        &self,
        build_id: BuildId,
        session_id: SessionId,
    ) -> StoreResult<Vec<Instance>> {
        Ok(self
            .objects
            .read()
            .await
            .instances
            .values()
            .filter(|i| i.spec.build_id == build_id && i.status.session_id == Some(session_id))
            .cloned()
            .collect())
    }

    async fn create_instance(&self, mut instance: Instance) -> StoreResult<Instance> {
        self.check_writable()?;
        let key = instance.key();
        let mut objects = self.objects.write().await;
        if objects.instances.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: ObjectKind::Instance,
                key: key.to_string(),
            });
        }

        instance.metadata.resource_version = objects.next_version();
        instance.metadata.created_at = Utc::now();
        objects.instances.insert(key, instance.clone());
        drop(objects);

        self.publish(vec![instance_event(&instance, WatchAction::Applied)]);
        Ok(instance)
    }

    async fn set_instance_finalizers(
        &self,
        key: &ObjectKey,
        finalizers: Vec<String>,
    ) -> StoreResult<Instance> {
        self.check_writable()?;
        let mut events = Vec::new();
        let updated = {
            let mut objects = self.objects.write().await;
            let version = objects.next_version();
            let instance = objects
                .instances
                .get_mut(key)
                .ok_or_else(|| StoreError::not_found(ObjectKind::Instance, key))?;
            instance.metadata.finalizers = finalizers;
            instance.metadata.resource_version = version;
            let updated = instance.clone();

            if updated.metadata.is_deleting() && updated.metadata.finalizers.is_empty() {
                objects.remove_instance(key, &mut events);
            } else {
                events.push(instance_event(&updated, WatchAction::Applied));
            }
            updated
        };
        self.publish(events);
        Ok(updated)
    }

    async fn patch_instance_status(
        &self,
        key: &ObjectKey,
        patch: InstanceStatusPatch,
        precondition: Option<u64>,
    ) -> StoreResult<Instance> {
        self.check_writable()?;
        let mut objects = self.objects.write().await;
        let version = objects.next_version();
        let instance = objects
            .instances
            .get_mut(key)
            .ok_or_else(|| StoreError::not_found(ObjectKind::Instance, key))?;
        check_precondition(ObjectKind::Instance, key, instance.metadata.resource_version, precondition)?;

        patch
            .apply_to(&mut instance.status)
            .map_err(|e| StoreError::Invalid {
                kind: ObjectKind::Instance,
                key: key.to_string(),
                message: e.to_string(),
            })?;
        instance.metadata.resource_version = version;
        let instance = instance.clone();
        drop(objects);

        self.publish(vec![instance_event(&instance, WatchAction::Applied)]);
        Ok(instance)
    }

    async fn delete_instance(&self, key: &ObjectKey, precondition: Option<u64>) -> StoreResult<()> {
        self.check_writable()?;
        let mut events = Vec::new();
        self.objects
            .write()
            .await
            .delete_instance(key, precondition, &mut events)?;
        self.publish(events);
        Ok(())
    }

    async fn get_workload(&self, key: &ObjectKey) -> StoreResult<Workload> {
        self.objects
            .read()
            .await
            .workloads
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(ObjectKind::Workload, key))
    }

    async fn create_workload(&self, mut workload: Workload) -> StoreResult<Workload> {
        self.check_writable()?;
        let key = workload.metadata.key();
        let mut objects = self.objects.write().await;
        if objects.workloads.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: ObjectKind::Workload,
                key: key.to_string(),
            });
        }
        let owner = workload
            .metadata
            .owner_key()
            .ok_or_else(|| StoreError::Invalid {
                kind: ObjectKind::Workload,
                key: key.to_string(),
                message: "workload must be owned by an instance".to_string(),
            })?;
        if !objects.instances.contains_key(&owner) {
            return Err(StoreError::not_found(ObjectKind::Instance, &owner));
        }

        workload.metadata.resource_version = objects.next_version();
        workload.metadata.created_at = Utc::now();
        objects.workloads.insert(key, workload.clone());
        drop(objects);

        self.publish(vec![workload_event(&workload, WatchAction::Applied)]);
        Ok(workload)
    }

    async fn set_workload_annotation(
        &self,
        key: &ObjectKey,
        name: &str,
        value: &str,
    ) -> StoreResult<Workload> {
        self.check_writable()?;
        let mut objects = self.objects.write().await;
        let version = objects.next_version();
        let workload = objects
            .workloads
            .get_mut(key)
            .ok_or_else(|| StoreError::not_found(ObjectKind::Workload, key))?;
        workload
            .metadata
            .annotations
            .insert(name.to_string(), value.to_string());
        workload.metadata.resource_version = version;
        let workload = workload.clone();
        drop(objects);

        self.publish(vec![workload_event(&workload, WatchAction::Applied)]);
        Ok(workload)
    }

    async fn list_nodes(&self) -> StoreResult<Vec<Node>> {
        Ok(self.objects.read().await.nodes.values().cloned().collect())
    }

    async fn get_node(&self, name: &str) -> StoreResult<Node> {
        self.objects
            .read()
            .await
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found(ObjectKind::Node, name))
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
