//! Object model for builds, instances, workloads, and nodes.
//!
//! Every stored object carries an [`ObjectMeta`] whose `resource_version`
//! is the optimistic concurrency token. Versions are assigned by the store
//! and increase on every write.

mod build;
mod instance;
mod node;
mod validate;
mod workload;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use build::{Build, BuildHealth, BuildSpec, BuildStatus, ContainerPort, WorkloadTemplate};
pub use instance::{
    Instance, InstanceHealth, InstanceSpec, InstanceState, InstanceStatus, InstanceStatusPatch,
    TransitionError,
};
pub use node::Node;
pub use validate::{validate_build_spec, validate_build_update, ValidationError};
pub use workload::{Workload, WorkloadPhase};

#[cfg(test)]
pub(crate) use build::fixtures;

// =============================================================================
// Well-known names
// =============================================================================

/// Finalizer that holds an instance until its host ports are released.
pub const INSTANCE_FINALIZER: &str = "fleet.dev/instance-finalizer";

/// Label carrying the owning build's name.
pub const BUILD_NAME_LABEL: &str = "fleet.dev/build-name";

/// Label carrying the owning build's id.
pub const BUILD_ID_LABEL: &str = "fleet.dev/build-id";

/// Node label that marks a node as part of the game-server pool.
pub const GAME_SERVER_NODE_LABEL: &str = "fleet.dev/gameservernode";

/// Workload annotation read by cluster autoscalers.
pub const SAFE_TO_EVICT_ANNOTATION: &str = "cluster-autoscaler.kubernetes.io/safe-to-evict";

// =============================================================================
// Keys and metadata
// =============================================================================

/// Namespaced name of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Metadata common to every stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,

    /// Optimistic concurrency token, assigned by the store.
    #[serde(default)]
    pub resource_version: u64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    /// Name of the owning object in the same namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Set once deletion was requested while finalizers were present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            resource_version: 0,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            finalizers: Vec::new(),
            owner: None,
            created_at: Utc::now(),
            deletion_timestamp: None,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// Key of the owning object, if any.
    pub fn owner_key(&self) -> Option<ObjectKey> {
        self.owner
            .as_ref()
            .map(|owner| ObjectKey::new(&self.namespace, owner))
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        assert_eq!(ObjectKey::new("default", "gs-1").to_string(), "default/gs-1");
    }

    #[test]
    fn test_owner_key_shares_namespace() {
        let mut meta = ObjectMeta::new("games", "gs-1");
        assert_eq!(meta.owner_key(), None);
        meta.owner = Some("build-a".to_string());
        assert_eq!(meta.owner_key(), Some(ObjectKey::new("games", "build-a")));
    }

    #[test]
    fn test_finalizers() {
        let mut meta = ObjectMeta::new("games", "gs-1");
        assert!(!meta.has_finalizer(INSTANCE_FINALIZER));
        meta.finalizers.push(INSTANCE_FINALIZER.to_string());
        assert!(meta.has_finalizer(INSTANCE_FINALIZER));
        assert!(!meta.is_deleting());
    }
}
