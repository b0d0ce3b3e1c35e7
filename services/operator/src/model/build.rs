//! Build: the desired-state record for one game-server workload.

use std::collections::BTreeMap;

use fleet_id::BuildId;
use fleet_reconcile::DEFAULT_CRASHES_TO_MARK_UNHEALTHY;
use serde::{Deserialize, Serialize};

use super::{ObjectKey, ObjectMeta};

/// A container port declared by the workload template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    pub name: String,
    pub container_port: u16,

    /// Assigned by the scaler for exposed ports. Must not be set on a build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
}

/// Template for the runtime workload backing each instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadTemplate {
    pub image: String,

    #[serde(default)]
    pub ports: Vec<ContainerPort>,

    #[serde(default)]
    pub host_network: bool,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

fn default_crash_threshold() -> Option<u32> {
    Some(DEFAULT_CRASHES_TO_MARK_UNHEALTHY)
}

/// Desired state of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    #[serde(rename = "buildID")]
    pub build_id: BuildId,

    /// Target number of idle, allocatable instances.
    pub standing_by: usize,

    /// Hard cap on the total number of instances.
    pub max: usize,

    /// Crash count that marks the build unhealthy; `null` disables.
    #[serde(default = "default_crash_threshold")]
    pub crashes_to_mark_unhealthy: Option<u32>,

    /// Names of template ports that receive a host port.
    #[serde(default)]
    pub ports_to_expose: Vec<String>,

    pub template: WorkloadTemplate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildHealth {
    #[default]
    Healthy,
    Unhealthy,
}

/// Observed state of a build, written by the scaler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    pub current_pending: usize,
    pub current_initializing: usize,
    pub current_standing_by: usize,
    pub current_active: usize,
    pub crashes_count: u32,
    pub health: BuildHealth,

    /// `"<standing by>/<desired standing by>"`.
    pub current_standing_by_ready_desired: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub metadata: ObjectMeta,
    pub spec: BuildSpec,
    #[serde(default)]
    pub status: BuildStatus,
}

impl Build {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: BuildSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: BuildStatus::default(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// Number of host ports each instance of this build needs.
    pub fn host_ports_per_instance(&self) -> usize {
        self.spec
            .template
            .ports
            .iter()
            .filter(|p| self.spec.ports_to_expose.contains(&p.name))
            .count()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_ports_per_instance() {
        let mut build = Build::new("default", "b", fixtures::spec(2, 4));
        assert_eq!(build.host_ports_per_instance(), 1);

        build.spec.template.ports.push(ContainerPort {
            name: "metrics".to_string(),
            container_port: 9000,
            host_port: None,
        });
        assert_eq!(build.host_ports_per_instance(), 1);
    }

    #[test]
    fn test_crash_threshold_defaults() {
        let json = serde_json::json!({
            "buildID": "85ffe8da-c82f-4035-86c5-9d2b5f42d6f5",
            "standingBy": 2,
            "max": 4,
            "template": { "image": "game:1" }
        });
        let spec: BuildSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.crashes_to_mark_unhealthy, Some(5));
        assert!(spec.ports_to_expose.is_empty());
    }

    #[test]
    fn test_crash_threshold_null_disables() {
        let json = serde_json::json!({
            "buildID": "85ffe8da-c82f-4035-86c5-9d2b5f42d6f5",
            "standingBy": 2,
            "max": 4,
            "crashesToMarkUnhealthy": null,
            "template": { "image": "game:1" }
        });
        let spec: BuildSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.crashes_to_mark_unhealthy, None);
    }
}
