#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_id::{BuildId, SessionId};
use fleet_operator::{
    allocation::AllocateArgs,
    config::Config,
    heartbeat::{self, GameState, Heartbeat},
    metrics,
    model::{
        Build, BuildSpec, ContainerPort, Instance, InstanceHealth, InstanceState, Node, ObjectKey,
        WorkloadTemplate,
    },
    operator::Operator,
    state::AppState,
    store::{MemoryStore, ObjectStore, PlacementWorker},
};
use tokio::sync::watch;

pub const NODE_IP: &str = "10.0.0.1";

const CONVERGE_TIMEOUT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(20);

pub fn spec(standing_by: usize, max: usize) -> BuildSpec {
    BuildSpec {
        build_id: BuildId::new(),
        standing_by,
        max,
        crashes_to_mark_unhealthy: Some(5),
        ports_to_expose: vec!["gameport".to_string()],
        template: WorkloadTemplate {
            image: "registry.local/game:1.0".to_string(),
            ports: vec![ContainerPort {
                name: "gameport".to_string(),
                container_port: 7777,
                host_port: None,
            }],
            host_network: false,
            env: BTreeMap::new(),
        },
    }
}

pub fn args(build: &Build) -> AllocateArgs {
    AllocateArgs {
        build_id: build.spec.build_id,
        session_id: SessionId::new(),
        session_cookie: None,
        initial_players: Vec::new(),
    }
}

/// A running operator over an in-process store, with a stand-in for the
/// cluster scheduler and the game processes.
pub struct Fleet {
    pub store: Arc<MemoryStore>,
    pub state: AppState,
    placement: PlacementWorker,
    operator: Option<Operator>,
    shutdown_tx: watch::Sender<bool>,
}

impl Fleet {
    pub async fn start(nodes: usize, min_port: u16, max_port: u16) -> Self {
        let store = Arc::new(MemoryStore::new());
        for i in 0..nodes {
            store.add_node(Node::new(format!("node-{i}"), NODE_IP)).await;
        }

        let config = Config {
            min_port,
            max_port,
            reconcile_workers: 2,
            pass_timeout: Duration::from_secs(2),
            resync_interval: Duration::from_millis(200),
            ..Config::default()
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let operator = Operator::start(
            &config,
            store.clone() as Arc<dyn ObjectStore>,
            metrics::init().unwrap(),
            shutdown_rx,
        )
        .await
        .unwrap();

        Self {
            state: operator.state().clone(),
            placement: PlacementWorker::new(store.clone(), Duration::from_millis(10)),
            store,
            operator: Some(operator),
            shutdown_tx,
        }
    }

    pub async fn create_build(&self, name: &str, spec: BuildSpec) -> Build {
        self.store
            .create_build(Build::new("default", name, spec))
            .await
            .unwrap()
    }

    pub async fn instances(&self, build: &Build) -> Vec<Instance> {
        self.store.list_instances_for_build(&build.key()).await.unwrap()
    }

    pub async fn build(&self, key: &ObjectKey) -> Build {
        self.store.get_build(key).await.unwrap()
    }

    /// One step of the outside world: place workloads and let started
    /// game processes report StandingBy once they have an address.
    pub async fn drive(&self) {
        self.placement.place_pending().await.unwrap();
        for instance in self.store.list_instances().await.unwrap() {
            let starting = matches!(
                instance.status.state,
                InstanceState::Pending | InstanceState::Initializing
            );
            if starting && instance.status.public_ip.is_some() && !instance.metadata.is_deleting() {
                let report = Heartbeat {
                    current_game_state: GameState::StandingBy,
                    current_game_health: InstanceHealth::Healthy,
                    current_players: Vec::new(),
                };
                // racing the controllers is fine; the next step retries
                let _ = heartbeat::apply_heartbeat(self.store.as_ref(), &instance.key(), &report).await;
            }
        }
    }

    /// Drive the fleet until `done` holds for the instances of `build`.
    pub async fn converge<F>(&self, build: &Build, what: &str, mut done: F) -> Vec<Instance>
    where
        F: FnMut(&[Instance]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + CONVERGE_TIMEOUT;
        loop {
            self.drive().await;
            let instances = self.instances(build).await;
            if done(&instances) {
                return instances;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("fleet did not converge: {what}; instances: {instances:#?}");
            }
            tokio::time::sleep(POLL).await;
        }
    }

    /// Drive the fleet until `done` holds for the stored build.
    pub async fn converge_build<F>(&self, key: &ObjectKey, what: &str, mut done: F) -> Build
    where
        F: FnMut(&Build) -> bool,
    {
        let deadline = tokio::time::Instant::now() + CONVERGE_TIMEOUT;
        loop {
            self.drive().await;
            let build = self.build(key).await;
            if done(&build) {
                return build;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("build did not converge: {what}; status: {:#?}", build.status);
            }
            tokio::time::sleep(POLL).await;
        }
    }

    /// Wait until `build` has exactly `count` live standing-by instances,
    /// all of them queued for allocation.
    pub async fn standing_by(&self, build: &Build, count: usize) -> Vec<Instance> {
        let build_id = build.spec.build_id;
        let queue_len = || self.state.queue().len(build_id);
        let instances = self
            .converge(build, &format!("{count} standing by"), |instances| {
                live_in(instances, InstanceState::StandingBy) == count && queue_len() == count
            })
            .await;
        instances
            .into_iter()
            .filter(|i| i.status.state == InstanceState::StandingBy && !i.metadata.is_deleting())
            .collect()
    }

    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(operator) = self.operator.take() {
            operator.join(Duration::from_secs(5)).await;
        }
    }
}

/// Instances in `state` that are not being deleted.
pub fn live_in(instances: &[Instance], state: InstanceState) -> usize {
    instances
        .iter()
        .filter(|i| i.status.state == state && !i.metadata.is_deleting())
        .count()
}
