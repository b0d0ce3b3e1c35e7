//! Keeps the allocation queue in step with instance state.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::queue::{InstanceQueue, QueueEntry, Upsert};
use crate::controllers::{Action, ControllerResult, Reconciler};
use crate::model::{Instance, InstanceHealth, InstanceState, ObjectKey};
use crate::store::ObjectStore;

/// Whether `instance` may be handed out. An instance without a public
/// address has nothing to tell the client, so it stays out of the queue.
pub fn is_allocatable(instance: &Instance) -> bool {
    instance.status.state == InstanceState::StandingBy
        && instance.status.health != InstanceHealth::Unhealthy
        && instance.status.public_ip.is_some()
        && !instance.metadata.is_deleting()
}

/// Queues allocatable instances and drops everything else.
pub struct QueueSyncReconciler {
    store: Arc<dyn ObjectStore>,
    queue: Arc<InstanceQueue>,
}

impl QueueSyncReconciler {
    pub fn new(store: Arc<dyn ObjectStore>, queue: Arc<InstanceQueue>) -> Self {
        Self { store, queue }
    }
}

#[async_trait]
impl Reconciler for QueueSyncReconciler {
    fn name(&self) -> &'static str {
        "allocation-queue"
    }

    async fn reconcile(&self, key: &ObjectKey) -> ControllerResult<Action> {
        let instance = match self.store.get_instance(key).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => {
                self.queue.remove(key);
                return Ok(Action::Done);
            }
            Err(e) => return Err(e.into()),
        };

        if !is_allocatable(&instance) {
            if self.queue.remove(key).is_some() {
                debug!(instance = %key, state = instance.status.state.as_str(), "Dequeued instance");
            }
            return Ok(Action::Done);
        }

        match self.queue.upsert(QueueEntry::from_instance(&instance)) {
            Upsert::Inserted => debug!(instance = %key, node_age = instance.status.node_age, "Queued instance"),
            Upsert::Refreshed => debug!(instance = %key, "Refreshed queued instance"),
            Upsert::Unchanged => {}
        }
        Ok(Action::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::build::new_instance;
    use crate::model::fixtures::spec;
    use crate::model::{Build, InstanceStatusPatch};
    use crate::store::MemoryStore;

    async fn setup() -> (Arc<MemoryStore>, Arc<InstanceQueue>, QueueSyncReconciler, Build) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(InstanceQueue::new());
        let sync = QueueSyncReconciler::new(store.clone(), queue.clone());
        let build = store
            .create_build(Build::new("default", "build-a", spec(1, 2)))
            .await
            .unwrap();
        (store, queue, sync, build)
    }

    async fn patch(store: &MemoryStore, key: &ObjectKey, patch: InstanceStatusPatch) -> Instance {
        store.patch_instance_status(key, patch, None).await.unwrap()
    }

    fn standing_by() -> InstanceStatusPatch {
        InstanceStatusPatch {
            state: Some(InstanceState::StandingBy),
            public_ip: Some("203.0.113.7".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_only_standing_by_is_queued() {
        let (store, queue, sync, build) = setup().await;
        let instance = store
            .create_instance(new_instance(&build, "gs-1", &[]))
            .await
            .unwrap();
        let key = instance.key();

        sync.reconcile(&key).await.unwrap();
        assert!(!queue.contains(&key));

        let instance = patch(&store, &key, standing_by()).await;
        sync.reconcile(&key).await.unwrap();
        assert_eq!(queue.pop(build.spec.build_id).unwrap().resource_version, instance.metadata.resource_version);

        sync.reconcile(&key).await.unwrap();
        patch(&store, &key, InstanceStatusPatch::state(InstanceState::Active)).await;
        sync.reconcile(&key).await.unwrap();
        assert!(!queue.contains(&key));
    }

    #[tokio::test]
    async fn test_unhealthy_and_deleted_are_dropped() {
        let (store, queue, sync, build) = setup().await;
        store.create_instance(new_instance(&build, "gs-1", &[])).await.unwrap();
        let key = ObjectKey::new("default", "gs-1");
        patch(&store, &key, standing_by()).await;
        sync.reconcile(&key).await.unwrap();
        assert!(queue.contains(&key));

        patch(
            &store,
            &key,
            InstanceStatusPatch {
                health: Some(InstanceHealth::Unhealthy),
                ..Default::default()
            },
        )
        .await;
        sync.reconcile(&key).await.unwrap();
        assert!(!queue.contains(&key));

        store.delete_instance(&key, None).await.unwrap();
        sync.reconcile(&key).await.unwrap();
        assert_eq!(queue.total(), 0);
    }

    #[tokio::test]
    async fn test_refreshes_version_in_place() {
        let (store, queue, sync, build) = setup().await;
        store.create_instance(new_instance(&build, "gs-1", &[])).await.unwrap();
        let key = ObjectKey::new("default", "gs-1");
        patch(&store, &key, standing_by()).await;
        sync.reconcile(&key).await.unwrap();

        let latest = patch(
            &store,
            &key,
            InstanceStatusPatch {
                node_age: Some(4),
                ..Default::default()
            },
        )
        .await;
        sync.reconcile(&key).await.unwrap();

        let entry = queue.pop(build.spec.build_id).unwrap();
        assert_eq!(entry.resource_version, latest.metadata.resource_version);
        assert_eq!(entry.node_age, 4);
    }

    #[tokio::test]
    async fn test_standing_by_without_address_waits() {
        let (store, queue, sync, build) = setup().await;
        store.create_instance(new_instance(&build, "gs-1", &[])).await.unwrap();
        let key = ObjectKey::new("default", "gs-1");

        patch(&store, &key, InstanceStatusPatch::state(InstanceState::StandingBy)).await;
        sync.reconcile(&key).await.unwrap();
        assert!(!queue.contains(&key));

        let addressed = patch(
            &store,
            &key,
            InstanceStatusPatch {
                public_ip: Some("203.0.113.7".to_string()),
                ..Default::default()
            },
        )
        .await;
        sync.reconcile(&key).await.unwrap();
        let entry = queue.pop(build.spec.build_id).unwrap();
        assert_eq!(entry.key, key);
        assert_eq!(entry.resource_version, addressed.metadata.resource_version);
    }
}
