//! Runtime workload backing an instance (pod equivalent).

use serde::{Deserialize, Serialize};

use super::{Instance, ObjectMeta, WorkloadTemplate};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum WorkloadPhase {
    /// Not yet placed on a node.
    #[default]
    Pending,
    Running,
    Exited {
        exit_code: i32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    pub metadata: ObjectMeta,
    pub template: WorkloadTemplate,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    #[serde(default)]
    pub phase: WorkloadPhase,
}

impl Workload {
    /// Workload for `instance`, sharing its name and owned by it.
    pub fn for_instance(instance: &Instance) -> Self {
        let mut metadata = ObjectMeta::new(&instance.metadata.namespace, &instance.metadata.name);
        metadata.owner = Some(instance.metadata.name.clone());
        metadata.labels = instance.metadata.labels.clone();
        Self {
            metadata,
            template: instance.spec.template.clone(),
            node_name: None,
            phase: WorkloadPhase::Pending,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.phase {
            WorkloadPhase::Exited { exit_code } => Some(exit_code),
            _ => None,
        }
    }

    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.metadata.annotations.get(name).map(String::as_str)
    }
}
