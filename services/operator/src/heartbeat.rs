//! Heartbeats from running game-server processes.
//!
//! A game process reports its own state, health, and connected players.
//! Reports are folded into instance status under the same forward-only rules
//! the store enforces, and the reply tells the process what to do next. The
//! agent that relays heartbeats marks an instance unhealthy on its own when
//! they stop arriving; [`mark_unhealthy`] is its entry point.

use chrono::Utc;
use fleet_id::SessionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{
    Instance, InstanceHealth, InstanceState, InstanceStatusPatch, ObjectKey, TransitionError,
};
use crate::store::{ObjectStore, StoreError};

/// Attempts before giving up on a heartbeat that keeps racing other writers.
const MAX_ATTEMPTS: usize = 3;

/// State reported by the game process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameState {
    Initializing,
    StandingBy,
    Active,
    Terminating,
    Terminated,
}

impl GameState {
    /// Instance state this report moves toward, if any. Process shutdown is
    /// observed through the workload exit instead.
    fn instance_state(self) -> Option<InstanceState> {
        match self {
            GameState::Initializing => Some(InstanceState::Initializing),
            GameState::StandingBy => Some(InstanceState::StandingBy),
            GameState::Active => Some(InstanceState::Active),
            GameState::Terminating | GameState::Terminated => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedPlayer {
    #[serde(rename = "PlayerId")]
    pub player_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Heartbeat {
    pub current_game_state: GameState,

    /// Empty is treated as healthy.
    #[serde(default)]
    pub current_game_health: InstanceHealth,

    #[serde(default)]
    pub current_players: Vec<ConnectedPlayer>,
}

/// What the game process should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameOperation {
    Continue,
    /// The instance was allocated; start the session.
    Active,
    /// The instance is going away.
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub session_id: SessionId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_cookie: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial_players: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub operation: GameOperation,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_config: Option<SessionConfig>,
}

#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("instance {0} not found")]
    NotFound(ObjectKey),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("instance {0} kept changing while applying heartbeat")]
    Contended(ObjectKey),

    #[error(transparent)]
    Store(StoreError),
}

/// Status changes implied by `heartbeat`, or `None` if nothing changed.
fn plan_patch(instance: &Instance, heartbeat: &Heartbeat) -> Result<Option<InstanceStatusPatch>, TransitionError> {
    let status = &instance.status;
    if status.state.is_terminal() {
        return Ok(None);
    }
    let mut patch = InstanceStatusPatch::default();

    if let Some(reported) = heartbeat.current_game_state.instance_state() {
        match (status.state, reported) {
            (current, reported) if current == reported => {}
            // allocated, and the process has not caught up yet
            (InstanceState::Active, InstanceState::StandingBy) => {}
            // only allocation makes an instance active
            (_, InstanceState::Active) => {
                return Err(TransitionError::IllegalState {
                    from: status.state,
                    to: reported,
                });
            }
            (current, reported) if current.can_transition_to(reported) => {
                patch.state = Some(reported);
                if reported == InstanceState::StandingBy {
                    patch.reached_standing_by_on = Some(Utc::now());
                }
            }
            (current, reported) => {
                return Err(TransitionError::IllegalState {
                    from: current,
                    to: reported,
                });
            }
        }
    }

    let reported_health = match heartbeat.current_game_health {
        InstanceHealth::Unknown => InstanceHealth::Healthy,
        health => health,
    };
    if status.health != InstanceHealth::Unhealthy && status.health != reported_health {
        patch.health = Some(reported_health);
    }

    if status.state == InstanceState::Active {
        let players: Vec<String> = heartbeat
            .current_players
            .iter()
            .map(|p| p.player_id.clone())
            .collect();
        if players != status.connected_players {
            patch.connected_players = Some(players);
        }
    }

    Ok((patch != InstanceStatusPatch::default()).then_some(patch))
}

fn respond(instance: &Instance, heartbeat: &Heartbeat) -> HeartbeatResponse {
    let status = &instance.status;
    let operation = if instance.metadata.is_deleting() || status.state.is_terminal() {
        GameOperation::Terminate
    } else if status.state == InstanceState::Active && heartbeat.current_game_state == GameState::StandingBy {
        GameOperation::Active
    } else {
        GameOperation::Continue
    };
    let session_config = status.session_id.map(|session_id| SessionConfig {
        session_id,
        session_cookie: status.session_cookie.clone(),
        initial_players: status.initial_players.clone(),
    });
    HeartbeatResponse {
        operation,
        session_config,
    }
}

/// Fold one heartbeat into the instance's status.
pub async fn apply_heartbeat(
    store: &dyn ObjectStore,
    key: &ObjectKey,
    heartbeat: &Heartbeat,
) -> Result<HeartbeatResponse, HeartbeatError> {
    for _ in 0..MAX_ATTEMPTS {
        let instance = match store.get_instance(key).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => return Err(HeartbeatError::NotFound(key.clone())),
            Err(e) => return Err(HeartbeatError::Store(e)),
        };

        let Some(patch) = plan_patch(&instance, heartbeat)? else {
            return Ok(respond(&instance, heartbeat));
        };

        match store
            .patch_instance_status(key, patch.clone(), Some(instance.metadata.resource_version))
            .await
        {
            Ok(updated) => {
                if let Some(state) = patch.state {
                    info!(instance = %key, from = instance.status.state.as_str(), to = state.as_str(), "Instance state reported");
                }
                if patch.health == Some(InstanceHealth::Unhealthy) {
                    warn!(instance = %key, "Instance reported unhealthy");
                }
                return Ok(respond(&updated, heartbeat));
            }
            Err(e) if e.is_conflict() => {
                debug!(instance = %key, "Heartbeat raced another write, retrying");
            }
            Err(e) if e.is_not_found() => return Err(HeartbeatError::NotFound(key.clone())),
            Err(e) => return Err(HeartbeatError::Store(e)),
        }
    }
    Err(HeartbeatError::Contended(key.clone()))
}

/// Mark an instance unhealthy after its heartbeats stopped.
pub async fn mark_unhealthy(store: &dyn ObjectStore, key: &ObjectKey) -> Result<Instance, StoreError> {
    let patch = InstanceStatusPatch {
        health: Some(InstanceHealth::Unhealthy),
        ..Default::default()
    };
    let instance = store.patch_instance_status(key, patch, None).await?;
    warn!(instance = %key, "Instance marked unhealthy after missed heartbeats");
    Ok(instance)
}
