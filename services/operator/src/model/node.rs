//! Cluster nodes, as far as the fleet cares about them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::GAME_SERVER_NODE_LABEL;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub name: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    pub ready: bool,
    pub schedulable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ip: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Node {
    /// A ready, schedulable node with no labels.
    pub fn new(name: impl Into<String>, internal_ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            ready: true,
            schedulable: true,
            internal_ip: Some(internal_ip.into()),
            external_ip: None,
            created_at: Utc::now(),
        }
    }

    /// Whether this node adds host port capacity.
    pub fn is_eligible(&self, game_server_nodes_only: bool) -> bool {
        if !self.ready || !self.schedulable {
            return false;
        }
        !game_server_nodes_only
            || self
                .labels
                .get(GAME_SERVER_NODE_LABEL)
                .is_some_and(|v| v == "true")
    }

    /// Whole days since the node was created.
    pub fn age_days(&self, now: DateTime<Utc>) -> u32 {
        let days = (now - self.created_at).num_days().max(0);
        u32::try_from(days).unwrap_or(u32::MAX)
    }

    /// Address players should connect to: external if known, else internal.
    pub fn public_ip(&self) -> Option<&str> {
        self.external_ip
            .as_deref()
            .or(self.internal_ip.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_eligibility() {
        let mut node = Node::new("n1", "10.0.0.1");
        assert!(node.is_eligible(false));
        assert!(!node.is_eligible(true));

        node.labels
            .insert(GAME_SERVER_NODE_LABEL.to_string(), "true".to_string());
        assert!(node.is_eligible(true));

        node.schedulable = false;
        assert!(!node.is_eligible(false));
    }

    #[test]
    fn test_age_days() {
        let mut node = Node::new("n1", "10.0.0.1");
        let now = Utc::now();
        node.created_at = now - Duration::hours(49);
        assert_eq!(node.age_days(now), 2);
        node.created_at = now + Duration::hours(1);
        assert_eq!(node.age_days(now), 0);
    }

    #[test]
    fn test_public_ip_prefers_external() {
        let mut node = Node::new("n1", "10.0.0.1");
        assert_eq!(node.public_ip(), Some("10.0.0.1"));
        node.external_ip = Some("20.1.2.3".to_string());
        assert_eq!(node.public_ip(), Some("20.1.2.3"));
    }
}
