//! Allocation: turn "give me a server" into exactly one standing-by to
//! active transition.
//!
//! Candidates come off the per-build [`InstanceQueue`]. Each one is claimed
//! with a status patch guarded by the version it was queued at, so two
//! callers racing for the same instance cannot both win. A losing or vanished
//! candidate, or one whose claim hit a store error, is handed back to the
//! queue sync controller for re-evaluation and the next candidate is tried,
//! up to a fixed number of attempts.

use std::sync::Arc;
use std::time::Duration;

use fleet_id::{BuildId, IdError, SessionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::queue::{InstanceQueue, QueueEntry};
use crate::metrics::{AllocationOutcome, Metrics};
use crate::model::{Instance, InstanceState, InstanceStatusPatch, ObjectKey};
use crate::store::{ObjectStore, StoreError};

/// Default number of candidates tried per request.
pub const DEFAULT_ATTEMPTS: usize = 3;

/// Capacity of the re-evaluation channel.
pub const REQUEUE_CAPACITY: usize = 100;

/// Allocation request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocateRequest {
    #[serde(rename = "buildID", default)]
    pub build_id: String,

    #[serde(rename = "sessionID", default)]
    pub session_id: String,

    #[serde(rename = "sessionCookie", default)]
    pub session_cookie: String,

    #[serde(rename = "initialPlayers", default)]
    pub initial_players: Vec<String>,
}

impl AllocateRequest {
    pub fn validate(self) -> Result<AllocateArgs, AllocationError> {
        let build_id = self
            .build_id
            .parse()
            .map_err(|source| AllocationError::Validation { field: "buildID", source })?;
        let session_id = self
            .session_id
            .parse()
            .map_err(|source| AllocationError::Validation { field: "sessionID", source })?;
        Ok(AllocateArgs {
            build_id,
            session_id,
            session_cookie: (!self.session_cookie.is_empty()).then_some(self.session_cookie),
            initial_players: self.initial_players,
        })
    }
}

/// Validated allocation arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocateArgs {
    pub build_id: BuildId,
    pub session_id: SessionId,
    pub session_cookie: Option<String>,
    pub initial_players: Vec<String>,
}

/// Allocation response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateResponse {
    #[serde(rename = "IPv4Address")]
    pub ipv4_address: String,

    /// `"name:hostPort"` pairs joined by commas.
    #[serde(rename = "Ports")]
    pub ports: String,

    #[serde(rename = "SessionID")]
    pub session_id: SessionId,
}

impl AllocateResponse {
    fn from_instance(instance: &Instance, session_id: SessionId) -> Self {
        Self {
            ipv4_address: instance.status.public_ip.clone().unwrap_or_default(),
            ports: instance.status.ports.clone(),
            session_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("invalid {field}: {source}")]
    Validation {
        field: &'static str,
        #[source]
        source: IdError,
    },

    #[error("build {build_id} not found")]
    BuildNotFound { build_id: BuildId },

    /// No standing-by instance is available.
    #[error("no standing-by instance available for build {build_id}")]
    Exhausted { build_id: BuildId },

    #[error("allocation for build {build_id} lost the race {attempts} times")]
    RetriesExhausted { build_id: BuildId, attempts: usize },

    /// More than one live instance claims the session.
    #[error("{count} instances of build {build_id} are bound to session {session_id}")]
    DuplicateSession {
        build_id: BuildId,
        session_id: SessionId,
        count: usize,
    },

    #[error("allocation timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Backend(#[from] StoreError),
}

/// Why a single claim attempt failed.
#[derive(Debug, Error)]
pub enum AttemptError {
    /// The candidate changed since it was queued.
    #[error("candidate changed: {0}")]
    Conflict(StoreError),

    #[error("candidate gone: {0}")]
    NotFound(StoreError),

    #[error(transparent)]
    Store(StoreError),
}

/// Claim one candidate for `args`' session.
///
/// The patch only applies if the instance is still at the version it was
/// queued with.
pub async fn attempt(
    store: &dyn ObjectStore,
    candidate: &QueueEntry,
    args: &AllocateArgs,
) -> Result<Instance, AttemptError> {
    let patch = InstanceStatusPatch {
        state: Some(InstanceState::Active),
        session_id: Some(args.session_id),
        session_cookie: args.session_cookie.clone(),
        initial_players: Some(args.initial_players.clone()),
        ..Default::default()
    };
    store
        .patch_instance_status(&candidate.key, patch, Some(candidate.resource_version))
        .await
        .map_err(|e| match e {
            StoreError::Conflict { .. } | StoreError::Invalid { .. } => AttemptError::Conflict(e),
            StoreError::NotFound { .. } => AttemptError::NotFound(e),
            e => AttemptError::Store(e),
        })
}

#[derive(Clone)]
pub struct AllocationEngine {
    store: Arc<dyn ObjectStore>,
    queue: Arc<InstanceQueue>,
    requeue: mpsc::Sender<ObjectKey>,
    metrics: Metrics,
    attempts: usize,
}

impl AllocationEngine {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        queue: Arc<InstanceQueue>,
        requeue: mpsc::Sender<ObjectKey>,
        metrics: Metrics,
        attempts: usize,
    ) -> Self {
        Self {
            store,
            queue,
            requeue,
            metrics,
            attempts: attempts.max(1),
        }
    }

    /// Ask for a candidate to be re-evaluated. Dropped when the channel is
    /// full; the periodic resync catches up.
    fn reevaluate(&self, key: ObjectKey) {
        if let Err(e) = self.requeue.try_send(key) {
            debug!(error = %e, "Re-evaluation request dropped");
        }
    }

    /// Allocate an instance of `args.build_id` to `args.session_id`.
    ///
    /// Repeating a request for a session that already holds an instance
    /// returns that instance again.
    pub async fn allocate(&self, args: &AllocateArgs) -> Result<AllocateResponse, AllocationError> {
        let build = self
            .store
            .find_build_by_id(args.build_id)
            .await?
            .ok_or(AllocationError::BuildNotFound { build_id: args.build_id })?;
        let build_name = build.metadata.name.as_str();
        self.metrics.record_allocation(build_name, AllocationOutcome::Attempted);

        let existing = self
            .store
            .find_instances_by_session(args.build_id, args.session_id)
            .await?;
        let live: Vec<&Instance> = existing.iter().filter(|i| !i.metadata.is_deleting()).collect();
        match live.as_slice() {
            [] => {}
            [instance] => {
                info!(build = build_name, session = %args.session_id, instance = %instance.key(), "Session already allocated");
                self.metrics.record_allocation(build_name, AllocationOutcome::Succeeded);
                return Ok(AllocateResponse::from_instance(instance, args.session_id));
            }
            _ => {
                self.metrics.record_allocation(build_name, AllocationOutcome::Failed);
                warn!(build = build_name, session = %args.session_id, count = live.len(), "Session bound to several instances");
                return Err(AllocationError::DuplicateSession {
                    build_id: args.build_id,
                    session_id: args.session_id,
                    count: live.len(),
                });
            }
        }

        let mut backend_error = None;
        for attempt_no in 1..=self.attempts {
            let Some(candidate) = self.queue.pop(args.build_id) else {
                if let Some(e) = backend_error {
                    self.metrics.record_allocation(build_name, AllocationOutcome::Failed);
                    return Err(AllocationError::Backend(e));
                }
                self.metrics.record_allocation(build_name, AllocationOutcome::Throttled);
                return Err(AllocationError::Exhausted { build_id: args.build_id });
            };

            match attempt(self.store.as_ref(), &candidate, args).await {
                Ok(instance) => {
                    self.metrics.record_allocation(build_name, AllocationOutcome::Succeeded);
                    info!(
                        build = build_name,
                        session = %args.session_id,
                        instance = %instance.key(),
                        attempt = attempt_no,
                        "Allocated instance"
                    );
                    return Ok(AllocateResponse::from_instance(&instance, args.session_id));
                }
                Err(AttemptError::Conflict(e) | AttemptError::NotFound(e)) => {
                    self.metrics.record_allocation(build_name, AllocationOutcome::Retried);
                    debug!(build = build_name, candidate = %candidate.key, error = %e, "Candidate lost, retrying");
                    self.reevaluate(candidate.key);
                }
                Err(AttemptError::Store(e)) => {
                    self.metrics.record_allocation(build_name, AllocationOutcome::Retried);
                    warn!(build = build_name, candidate = %candidate.key, error = %e, "Claim failed, retrying");
                    // untouched; give it back
                    self.reevaluate(candidate.key);
                    backend_error = Some(e);
                }
            }
        }

        self.metrics.record_allocation(build_name, AllocationOutcome::Failed);
        if let Some(e) = backend_error {
            return Err(AllocationError::Backend(e));
        }
        Err(AllocationError::RetriesExhausted {
            build_id: args.build_id,
            attempts: self.attempts,
        })
    }

    /// [`allocate`](Self::allocate) bounded by `timeout`. The in-flight
    /// attempt is dropped when the deadline passes.
    pub async fn allocate_within(
        &self,
        args: &AllocateArgs,
        timeout: Duration,
    ) -> Result<AllocateResponse, AllocationError> {
        tokio::time::timeout(timeout, self.allocate(args))
            .await
            .map_err(|_| AllocationError::Timeout(timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::build::new_instance;
    use crate::metrics;
    use crate::model::fixtures::spec;
    use crate::model::Build;
    use crate::store::MemoryStore;

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<InstanceQueue>,
        engine: AllocationEngine,
        requeued: mpsc::Receiver<ObjectKey>,
        build: Build,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(InstanceQueue::new());
        let (tx, rx) = mpsc::channel(REQUEUE_CAPACITY);
        let engine = AllocationEngine::new(store.clone(), queue.clone(), tx, metrics::init().unwrap(), DEFAULT_ATTEMPTS);
        let build = store
            .create_build(Build::new("default", "build-a", spec(2, 4)))
            .await
            .unwrap();
        Harness {
            store,
            queue,
            engine,
            requeued: rx,
            build,
        }
    }

    impl Harness {
        /// A standing-by instance with an address, queued.
        async fn standing_by(&self, name: &str, port: u16) -> Instance {
            self.store
                .create_instance(new_instance(&self.build, name, &[port]))
                .await
                .unwrap();
            let instance = self
                .store
                .patch_instance_status(
                    &ObjectKey::new("default", name),
                    InstanceStatusPatch {
                        state: Some(InstanceState::StandingBy),
                        public_ip: Some("203.0.113.7".to_string()),
                        ports: Some(format!("gameport:{port}")),
                        ..Default::default()
                    },
                    None,
                )
                .await
                .unwrap();
            self.queue.push(QueueEntry::from_instance(&instance));
            instance
        }

        fn args(&self) -> AllocateArgs {
            AllocateArgs {
                build_id: self.build.spec.build_id,
                session_id: SessionId::new(),
                session_cookie: Some("cookie".to_string()),
                initial_players: vec!["player-1".to_string()],
            }
        }
    }

    #[test]
    fn test_validate_rejects_malformed_ids() {
        let request = AllocateRequest {
            build_id: "not-a-uuid".to_string(),
            session_id: SessionId::new().to_string(),
            ..Default::default()
        };
        assert!(matches!(
            request.validate(),
            Err(AllocationError::Validation { field: "buildID", .. })
        ));

        let request = AllocateRequest {
            build_id: BuildId::new().to_string(),
            session_id: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            request.validate(),
            Err(AllocationError::Validation { field: "sessionID", .. })
        ));
    }

    #[test]
    fn test_response_field_names() {
        let response = AllocateResponse {
            ipv4_address: "203.0.113.7".to_string(),
            ports: "gameport:10000".to_string(),
            session_id: SessionId::new(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["IPv4Address"], "203.0.113.7");
        assert_eq!(json["Ports"], "gameport:10000");
        assert!(json["SessionID"].is_string());
    }

    #[tokio::test]
    async fn test_allocates_and_binds_session() {
        let h = harness().await;
        let instance = h.standing_by("gs-1", 10000).await;
        let args = h.args();

        let response = h.engine.allocate(&args).await.unwrap();
        assert_eq!(response.ipv4_address, "203.0.113.7");
        assert_eq!(response.ports, "gameport:10000");
        assert_eq!(response.session_id, args.session_id);

        let status = h.store.get_instance(&instance.key()).await.unwrap().status;
        assert_eq!(status.state, InstanceState::Active);
        assert_eq!(status.session_id, Some(args.session_id));
        assert_eq!(status.session_cookie.as_deref(), Some("cookie"));
        assert_eq!(status.initial_players, vec!["player-1"]);
    }

    #[tokio::test]
    async fn test_same_session_is_idempotent() {
        let h = harness().await;
        h.standing_by("gs-1", 10000).await;
        h.standing_by("gs-2", 10001).await;
        let args = h.args();

        let first = h.engine.allocate(&args).await.unwrap();
        let second = h.engine.allocate(&args).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.queue.len(args.build_id), 1);
    }

    #[tokio::test]
    async fn test_empty_queue_is_exhausted() {
        let h = harness().await;
        let args = h.args();
        assert!(matches!(
            h.engine.allocate(&args).await,
            Err(AllocationError::Exhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_build() {
        let h = harness().await;
        let mut args = h.args();
        args.build_id = BuildId::new();
        assert!(matches!(
            h.engine.allocate(&args).await,
            Err(AllocationError::BuildNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_candidate_is_skipped_and_reevaluated() {
        let mut h = harness().await;
        let stale = h.standing_by("gs-1", 10000).await;
        h.standing_by("gs-2", 10001).await;

        // changes after being queued
        h.store
            .patch_instance_status(
                &stale.key(),
                InstanceStatusPatch {
                    connected_players: Some(vec!["x".to_string()]),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();

        h.engine.allocate(&h.args()).await.unwrap();
        assert_eq!(h.requeued.try_recv().unwrap(), stale.key());
        let stale_now = h.store.get_instance(&stale.key()).await.unwrap();
        assert_eq!(stale_now.status.state, InstanceState::StandingBy);
    }

    #[tokio::test]
    async fn test_vanished_candidates_exhaust_retries() {
        let h = harness().await;
        for i in 0..DEFAULT_ATTEMPTS {
            h.queue.push(QueueEntry {
                key: ObjectKey::new("default", format!("ghost-{i}")),
                build_id: h.build.spec.build_id,
                node_age: 0,
                resource_version: 1,
            });
        }
        assert!(matches!(
            h.engine.allocate(&h.args()).await,
            Err(AllocationError::RetriesExhausted { attempts: DEFAULT_ATTEMPTS, .. })
        ));
    }

    #[tokio::test]
    async fn test_backend_failure_surfaces_after_every_attempt() {
        let mut h = harness().await;
        let mut keys = Vec::new();
        for i in 0..DEFAULT_ATTEMPTS as u16 {
            keys.push(h.standing_by(&format!("gs-{i}"), 10000 + i).await.key());
        }
        h.store.set_fail_writes(true);
        assert!(matches!(
            h.engine.allocate(&h.args()).await,
            Err(AllocationError::Backend(_))
        ));

        // every candidate was tried and handed back
        assert_eq!(h.queue.len(h.build.spec.build_id), 0);
        let mut requeued = Vec::new();
        while let Ok(key) = h.requeued.try_recv() {
            requeued.push(key);
        }
        requeued.sort();
        keys.sort();
        assert_eq!(requeued, keys);
    }

    #[tokio::test]
    async fn test_transient_backend_failure_moves_to_next_candidate() {
        let mut h = harness().await;
        let first = h.standing_by("gs-1", 10000).await;
        let second = h.standing_by("gs-2", 10001).await;
        let args = h.args();
        h.store.fail_next_writes(1);

        let response = h.engine.allocate(&args).await.unwrap();
        assert_eq!(response.session_id, args.session_id);

        let claimed = h.requeued.try_recv().unwrap();
        let other = if claimed == first.key() { &second } else { &first };
        assert_eq!(
            h.store.get_instance(&claimed).await.unwrap().status.state,
            InstanceState::StandingBy
        );
        let winner = h.store.get_instance(&other.key()).await.unwrap();
        assert_eq!(winner.status.state, InstanceState::Active);
        assert_eq!(winner.status.session_id, Some(args.session_id));
    }

    #[tokio::test]
    async fn test_session_on_two_instances_is_an_error() {
        let h = harness().await;
        let args = h.args();
        for (name, port) in [("gs-1", 10000), ("gs-2", 10001)] {
            let instance = h.standing_by(name, port).await;
            h.store
                .patch_instance_status(
                    &instance.key(),
                    InstanceStatusPatch {
                        state: Some(InstanceState::Active),
                        session_id: Some(args.session_id),
                        ..Default::default()
                    },
                    None,
                )
                .await
                .unwrap();
        }

        assert!(matches!(
            h.engine.allocate(&args).await,
            Err(AllocationError::DuplicateSession { count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_allocations_get_distinct_instances() {
        let h = harness().await;
        for i in 0..4u16 {
            h.standing_by(&format!("gs-{i}"), 10000 + i).await;
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = h.engine.clone();
                let args = h.args();
                tokio::spawn(async move { engine.allocate(&args).await })
            })
            .collect();
        let mut ports = Vec::new();
        for handle in handles {
            ports.push(handle.await.unwrap().unwrap().ports);
        }
        ports.sort();
        ports.dedup();
        assert_eq!(ports.len(), 4);

        assert!(matches!(
            h.engine.allocate(&h.args()).await,
            Err(AllocationError::Exhausted { .. })
        ));
    }
}
