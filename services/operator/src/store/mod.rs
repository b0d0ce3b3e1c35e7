//! Object store seam.
//!
//! The orchestration substrate's object store is the only source of truth.
//! Controllers and the allocation engine talk to it exclusively through
//! [`ObjectStore`]; the in-process [`MemoryStore`] implements it for the
//! operator binary and for tests.

mod memory;
mod placement;

use std::fmt;

use async_trait::async_trait;
use fleet_id::{BuildId, SessionId};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::{
    Build, BuildSpec, BuildStatus, Instance, InstanceStatusPatch, Node, ObjectKey, Workload,
};

pub use memory::MemoryStore;
pub use placement::PlacementWorker;

/// Kinds of stored objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Build,
    Instance,
    Workload,
    Node,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectKind::Build => "build",
            ObjectKind::Instance => "instance",
            ObjectKind::Workload => "workload",
            ObjectKind::Node => "node",
        };
        f.write_str(s)
    }
}

/// Store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: ObjectKind, key: String },

    /// Optimistic concurrency precondition failed.
    #[error("{kind} {key} changed: expected version {expected}, found {actual}")]
    Conflict {
        kind: ObjectKind,
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: ObjectKind, key: String },

    /// The write was rejected by admission or state machine checks.
    #[error("invalid {kind} {key}: {message}")]
    Invalid {
        kind: ObjectKind,
        key: String,
        message: String,
    },

    /// The backend failed; the operation may be retried.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(kind: ObjectKind, key: impl fmt::Display) -> Self {
        StoreError::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    /// Created or updated.
    Applied,
    /// Physically removed.
    Deleted,
}

/// Change notification. Carries keys only; consumers re-fetch by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: ObjectKind,
    pub action: WatchAction,
    pub key: ObjectKey,
    /// Owning object: the build for instances, the instance for workloads.
    pub owner: Option<ObjectKey>,
}

/// Typed CRUD and watch over builds, instances, workloads, and nodes.
///
/// Every write bumps the object's `resource_version`. Writes that take a
/// `precondition` fail with [`StoreError::Conflict`] when the stored version
/// differs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    // builds
    async fn get_build(&self, key: &ObjectKey) -> StoreResult<Build>;
    async fn list_builds(&self) -> StoreResult<Vec<Build>>;
    async fn find_build_by_id(&self, build_id: BuildId) -> StoreResult<Option<Build>>;
    /// Runs admission validation and enforces build id uniqueness.
    async fn create_build(&self, build: Build) -> StoreResult<Build>;
    /// Runs admission validation; the build id is immutable.
    async fn update_build_spec(
        &self,
        key: &ObjectKey,
        spec: BuildSpec,
        precondition: Option<u64>,
    ) -> StoreResult<Build>;
    async fn patch_build_status(&self, key: &ObjectKey, status: BuildStatus) -> StoreResult<Build>;
    /// Removes the build and requests deletion of every instance it owns.
    async fn delete_build(&self, key: &ObjectKey) -> StoreResult<()>;

    // instances
    async fn get_instance(&self, key: &ObjectKey) -> StoreResult<Instance>;
    async fn list_instances(&self) -> StoreResult<Vec<Instance>>;
    async fn list_instances_for_build(&self, build: &ObjectKey) -> StoreResult<Vec<Instance>>;
    async fn find_instances_by_session(
        &self,
        build_id: BuildId,
        session_id: SessionId,
    ) -> StoreResult<Vec<Instance>>;
    async fn create_instance(&self, instance: Instance) -> StoreResult<Instance>;
    /// Replace the finalizer list. Removing the last finalizer of an
    /// instance pending deletion removes it.
    async fn set_instance_finalizers(
        &self,
        key: &ObjectKey,
        finalizers: Vec<String>,
    ) -> StoreResult<Instance>;
    /// Merge-patch status, enforcing the instance state machine.
    async fn patch_instance_status(
        &self,
        key: &ObjectKey,
        patch: InstanceStatusPatch,
        precondition: Option<u64>,
    ) -> StoreResult<Instance>;
    /// With finalizers present only marks the instance for deletion.
    async fn delete_instance(&self, key: &ObjectKey, precondition: Option<u64>) -> StoreResult<()>;

    // workloads
    async fn get_workload(&self, key: &ObjectKey) -> StoreResult<Workload>;
    async fn create_workload(&self, workload: Workload) -> StoreResult<Workload>;
    async fn set_workload_annotation(
        &self,
        key: &ObjectKey,
        name: &str,
        value: &str,
    ) -> StoreResult<Workload>;

    // nodes
    async fn list_nodes(&self) -> StoreResult<Vec<Node>>;
    async fn get_node(&self, name: &str) -> StoreResult<Node>;

    /// Subscribe to change notifications.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}
