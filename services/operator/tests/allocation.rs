mod common;

use std::collections::HashSet;

use common::{args, live_in, spec, Fleet, NODE_IP};
use fleet_operator::allocation::AllocationError;
use fleet_operator::model::{Instance, InstanceState};
use fleet_operator::store::ObjectStore;

#[tokio::test]
async fn test_standing_by_pool_allocates_up_to_max() {
    let fleet = Fleet::start(1, 10000, 10009).await;
    let build = fleet.create_build("arena", spec(2, 4)).await;

    fleet.standing_by(&build, 2).await;
    assert_eq!(fleet.state.registry().snapshot().held, 2);

    let mut ports = HashSet::new();
    for allocated in 0..4 {
        if allocated > 0 {
            // replenished until the cap is reached
            fleet
                .converge(&build, "a queued instance", |_| fleet.state.queue().len(build.spec.build_id) > 0)
                .await;
        }
        let response = fleet.state.engine().allocate(&args(&build)).await.unwrap();
        assert_eq!(response.ipv4_address, NODE_IP);
        assert!(response.ports.starts_with("gameport:"), "ports: {}", response.ports);
        assert!(ports.insert(response.ports), "host port handed out twice");
    }

    let instances = fleet
        .converge(&build, "4 active", |instances| live_in(instances, InstanceState::Active) == 4)
        .await;
    assert_eq!(instances.len(), 4);
    assert_eq!(live_in(&instances, InstanceState::StandingBy), 0);
    assert_eq!(fleet.state.registry().snapshot().held, 4);

    let err = fleet.state.engine().allocate(&args(&build)).await.unwrap_err();
    assert!(matches!(err, AllocationError::Exhausted { .. }), "got {err:?}");

    fleet.stop().await;
}

#[tokio::test]
async fn test_repeated_session_gets_same_instance() {
    let fleet = Fleet::start(1, 10000, 10009).await;
    let build = fleet.create_build("arena", spec(2, 4)).await;
    fleet.standing_by(&build, 2).await;

    let request = args(&build);
    let first = fleet.state.engine().allocate(&request).await.unwrap();
    let second = fleet.state.engine().allocate(&request).await.unwrap();
    assert_eq!(first, second);

    let instances = fleet.instances(&build).await;
    let bound: Vec<_> = instances
        .iter()
        .filter(|i| i.status.session_id == Some(request.session_id))
        .collect();
    assert_eq!(bound.len(), 1);
    assert_eq!(bound[0].status.state, InstanceState::Active);

    fleet.stop().await;
}

#[tokio::test]
async fn test_zero_standing_by_is_exhausted() {
    let fleet = Fleet::start(1, 10000, 10009).await;
    let build = fleet.create_build("arena", spec(1, 4)).await;
    fleet.standing_by(&build, 1).await;
    fleet.state.engine().allocate(&args(&build)).await.unwrap();

    let mut drained = build.spec.clone();
    drained.standing_by = 0;
    fleet
        .store
        .update_build_spec(&build.key(), drained, None)
        .await
        .unwrap();
    fleet
        .converge(&build, "only the active instance left", |instances| {
            instances.len() == 1 && live_in(instances, InstanceState::Active) == 1
        })
        .await;
    fleet.standing_by(&build, 0).await;
    let before = fleet.instances(&build).await;

    let err = fleet.state.engine().allocate(&args(&build)).await.unwrap_err();
    assert!(matches!(err, AllocationError::Exhausted { .. }));

    // a refused request writes nothing
    let versions = |instances: &[Instance]| -> Vec<_> {
        instances
            .iter()
            .map(|i| (i.key(), i.metadata.resource_version))
            .collect()
    };
    assert_eq!(versions(&fleet.instances(&build).await), versions(&before));

    fleet.stop().await;
}

#[tokio::test]
async fn test_concurrent_allocations_never_share_an_instance() {
    let fleet = Fleet::start(2, 10000, 10009).await;
    let build = fleet.create_build("arena", spec(6, 6)).await;
    fleet.standing_by(&build, 6).await;

    let requests: Vec<_> = (0..8).map(|_| args(&build)).collect();
    let results = futures_util::future::join_all(
        requests.iter().map(|request| fleet.state.engine().allocate(request)),
    )
    .await;

    let granted: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(granted.len(), 6);
    let sessions: HashSet<_> = granted.iter().map(|r| r.session_id).collect();
    assert_eq!(sessions.len(), 6);

    let instances = fleet.instances(&build).await;
    let active: Vec<_> = instances
        .iter()
        .filter(|i| i.status.state == InstanceState::Active)
        .collect();
    assert_eq!(active.len(), 6);
    let bound: HashSet<_> = active.iter().filter_map(|i| i.status.session_id).collect();
    assert_eq!(bound.len(), 6);

    fleet.stop().await;
}
