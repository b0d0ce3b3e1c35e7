//! Instance: one game-server process plus its runtime workload.

use chrono::{DateTime, Utc};
use fleet_id::{BuildId, SessionId};
use fleet_reconcile::DeletionPriority;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{ObjectKey, ObjectMeta, WorkloadTemplate};

/// Lifecycle state of an instance.
///
/// States only move forward. `GameCompleted` and `Crashed` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    /// No state reported yet.
    #[default]
    #[serde(rename = "")]
    Pending,
    Initializing,
    StandingBy,
    Active,
    GameCompleted,
    Crashed,
}

impl InstanceState {
    fn rank(self) -> u8 {
        match self {
            InstanceState::Pending => 0,
            InstanceState::Initializing => 1,
            InstanceState::StandingBy => 2,
            InstanceState::Active => 3,
            InstanceState::GameCompleted | InstanceState::Crashed => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::GameCompleted | InstanceState::Crashed)
    }

    /// Whether moving from `self` to `next` is allowed. Staying put is allowed.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        self == next || (!self.is_terminal() && next.rank() > self.rank())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Pending => "Pending",
            InstanceState::Initializing => "Initializing",
            InstanceState::StandingBy => "StandingBy",
            InstanceState::Active => "Active",
            InstanceState::GameCompleted => "GameCompleted",
            InstanceState::Crashed => "Crashed",
        }
    }
}

/// Health reported for an instance. `Unhealthy` is sticky.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceHealth {
    #[default]
    #[serde(rename = "")]
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal state transition from {from:?} to {to:?}")]
    IllegalState {
        from: InstanceState,
        to: InstanceState,
    },

    #[error("instance is unhealthy and cannot report {to:?}")]
    UnhealthyIsFinal { to: InstanceHealth },

    #[error("instance already bound to session {current}")]
    SessionAlreadyBound { current: SessionId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    #[serde(rename = "buildID")]
    pub build_id: BuildId,

    /// Template with host ports filled in for exposed ports.
    pub template: WorkloadTemplate,

    #[serde(default)]
    pub ports_to_expose: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub state: InstanceState,
    pub health: InstanceHealth,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,

    /// `"name:hostPort"` pairs joined by commas.
    #[serde(default)]
    pub ports: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Age in days of the node hosting the instance.
    #[serde(default)]
    pub node_age: u32,

    #[serde(rename = "sessionID", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_cookie: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial_players: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connected_players: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reached_standing_by_on: Option<DateTime<Utc>>,
}

/// Merge patch for instance status. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceStatusPatch {
    pub state: Option<InstanceState>,
    pub health: Option<InstanceHealth>,
    pub public_ip: Option<String>,
    pub ports: Option<String>,
    pub node_name: Option<String>,
    pub node_age: Option<u32>,
    pub session_id: Option<SessionId>,
    pub session_cookie: Option<String>,
    pub initial_players: Option<Vec<String>>,
    pub connected_players: Option<Vec<String>>,
    pub reached_standing_by_on: Option<DateTime<Utc>>,
}

impl InstanceStatusPatch {
    pub fn state(state: InstanceState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// Apply the patch, enforcing forward-only state, sticky unhealthy
    /// health, and session immutability. On error `status` is unchanged.
    pub fn apply_to(&self, status: &mut InstanceStatus) -> Result<(), TransitionError> {
        if let Some(next) = self.state {
            if !status.state.can_transition_to(next) {
                return Err(TransitionError::IllegalState {
                    from: status.state,
                    to: next,
                });
            }
        }
        if let Some(health) = self.health {
            if status.health == InstanceHealth::Unhealthy && health != InstanceHealth::Unhealthy {
                return Err(TransitionError::UnhealthyIsFinal { to: health });
            }
        }
        if let (Some(current), Some(requested)) = (status.session_id, self.session_id) {
            if current != requested {
                return Err(TransitionError::SessionAlreadyBound { current });
            }
        }

        if let Some(state) = self.state {
            status.state = state;
        }
        if let Some(health) = self.health {
            status.health = health;
        }
        if let Some(ip) = &self.public_ip {
            status.public_ip = Some(ip.clone());
        }
        if let Some(ports) = &self.ports {
            status.ports = ports.clone();
        }
        if let Some(node) = &self.node_name {
            status.node_name = Some(node.clone());
        }
        if let Some(age) = self.node_age {
            status.node_age = age;
        }
        if let Some(session) = self.session_id {
            status.session_id = Some(session);
        }
        if let Some(cookie) = &self.session_cookie {
            status.session_cookie = Some(cookie.clone());
        }
        if let Some(players) = &self.initial_players {
            status.initial_players = players.clone();
        }
        if let Some(players) = &self.connected_players {
            status.connected_players = players.clone();
        }
        if let Some(at) = self.reached_standing_by_on {
            status.reached_standing_by_on = Some(at);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub metadata: ObjectMeta,
    pub spec: InstanceSpec,
    #[serde(default)]
    pub status: InstanceStatus,
}

impl Instance {
    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// Key of the owning build.
    pub fn build_key(&self) -> Option<ObjectKey> {
        self.metadata.owner_key()
    }

    /// Host ports assigned to this instance.
    pub fn host_ports(&self) -> Vec<u16> {
        self.spec
            .template
            .ports
            .iter()
            .filter_map(|p| p.host_port)
            .collect()
    }

    /// Whether the scaler must delete this instance regardless of demand.
    pub fn needs_cleanup(&self) -> bool {
        self.status.state.is_terminal() || self.status.health == InstanceHealth::Unhealthy
    }

    /// Scale-down priority; `None` for instances that must not be scaled down.
    pub fn deletion_priority(&self) -> Option<DeletionPriority> {
        match self.status.state {
            InstanceState::Pending => Some(DeletionPriority::Pending),
            InstanceState::Initializing => Some(DeletionPriority::Initializing),
            InstanceState::StandingBy => Some(DeletionPriority::StandingBy),
            _ => None,
        }
    }

    /// `"name:hostPort"` string for exposed ports.
    pub fn ports_string(&self) -> String {
        self.spec
            .template
            .ports
            .iter()
            .filter_map(|p| p.host_port.map(|hp| format!("{}:{}", p.name, hp)))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use InstanceState::*;

    #[rstest]
    #[case(Pending, Initializing, true)]
    #[case(Pending, StandingBy, true)]
    #[case(Initializing, StandingBy, true)]
    #[case(StandingBy, Active, true)]
    #[case(Active, GameCompleted, true)]
    #[case(Initializing, Crashed, true)]
    #[case(StandingBy, StandingBy, true)]
    #[case(Active, StandingBy, false)]
    #[case(StandingBy, Initializing, false)]
    #[case(GameCompleted, Crashed, false)]
    #[case(Crashed, Active, false)]
    fn test_can_transition_to(#[case] from: InstanceState, #[case] to: InstanceState, #[case] ok: bool) {
        assert_eq!(from.can_transition_to(to), ok);
    }

    #[test]
    fn test_pending_serializes_empty() {
        assert_eq!(serde_json::to_string(&Pending).unwrap(), "\"\"");
        assert_eq!(serde_json::to_string(&StandingBy).unwrap(), "\"StandingBy\"");
    }

    #[test]
    fn test_patch_rejects_backward() {
        let mut status = InstanceStatus {
            state: Active,
            ..InstanceStatus::default()
        };
        let err = InstanceStatusPatch::state(StandingBy)
            .apply_to(&mut status)
            .unwrap_err();
        assert_eq!(err, TransitionError::IllegalState { from: Active, to: StandingBy });
        assert_eq!(status.state, Active);
    }

    #[test]
    fn test_patch_session_is_immutable() {
        let first = SessionId::new();
        let mut status = InstanceStatus::default();
        InstanceStatusPatch {
            state: Some(StandingBy),
            session_id: Some(first),
            ..Default::default()
        }
        .apply_to(&mut status)
        .unwrap();

        // same session again is fine
        InstanceStatusPatch {
            session_id: Some(first),
            ..Default::default()
        }
        .apply_to(&mut status)
        .unwrap();

        let err = InstanceStatusPatch {
            state: Some(Active),
            session_id: Some(SessionId::new()),
            ..Default::default()
        }
        .apply_to(&mut status)
        .unwrap_err();
        assert_eq!(err, TransitionError::SessionAlreadyBound { current: first });
        assert_eq!(status.state, StandingBy);
    }

    #[test]
    fn test_unhealthy_is_sticky() {
        let mut status = InstanceStatus::default();
        InstanceStatusPatch {
            health: Some(InstanceHealth::Unhealthy),
            ..Default::default()
        }
        .apply_to(&mut status)
        .unwrap();

        let result = InstanceStatusPatch {
            health: Some(InstanceHealth::Healthy),
            ..Default::default()
        }
        .apply_to(&mut status);
        assert!(matches!(result, Err(TransitionError::UnhealthyIsFinal { .. })));
    }
}
