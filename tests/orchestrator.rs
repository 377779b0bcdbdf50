use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use nuages::driver::DriverCall;
use nuages::models::{DriverFailure, OperationRequest};
use nuages::{
    ContainerSpec, DriverError, ErrorKind, LifecycleState, MemoryStore, MockDriver,
    ObservedState, OperationKind, Orchestrator, OrchestratorConfig, OrchestratorError,
    StateStore,
};

struct Harness {
    store: Arc<MemoryStore>,
    driver: Arc<MockDriver>,
    orchestrator: Orchestrator,
}

fn harness_with(config: OrchestratorConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let driver = Arc::new(MockDriver::new());
    let orchestrator = Orchestrator::new(store.clone(), driver.clone(), config);
    Harness {
        store,
        driver,
        orchestrator,
    }
}

fn harness() -> Harness {
    harness_with(OrchestratorConfig::default())
}

fn request(id: &str, kind: OperationKind, key: &str) -> OperationRequest {
    OperationRequest::new(id, kind)
        .with_key(key)
        .with_caller("alice")
}

#[test_log::test(tokio::test)]
async fn test_create_start_then_start_again_is_rejected() {
    let h = harness();

    let created = h
        .orchestrator
        .execute(request("web", OperationKind::Create, "k1"))
        .await
        .unwrap();
    assert_eq!(created.state, LifecycleState::Stopped);
    assert_eq!(created.generation, 1);
    assert!(!created.replayed);

    let started = h
        .orchestrator
        .execute(request("web", OperationKind::Start, "k2"))
        .await
        .unwrap();
    assert_eq!(started.state, LifecycleState::Running);
    assert_eq!(started.generation, 2);

    let err = h
        .orchestrator
        .execute(request("web", OperationKind::Start, "k3"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    assert_eq!(err.state(), Some(LifecycleState::Running));
    assert_eq!(err.status_code(), 409);
    match err {
        OrchestratorError::InvalidTransition { allowed, .. } => {
            assert!(allowed.contains(&OperationKind::Stop));
            assert!(!allowed.contains(&OperationKind::Start));
        }
        other => panic!("unexpected error: {other}"),
    }

    let record = h.store.get("web").await.unwrap().unwrap();
    assert_eq!(record.state(), LifecycleState::Running);
    assert_eq!(record.generation(), 2);
    assert_eq!(record.last_caller(), Some("alice"));
    assert_eq!(h.driver.call_count(DriverCall::Start, "web"), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_stop_timeout_fails_then_destroy_clears() {
    let h = harness_with(OrchestratorConfig {
        driver_timeout_secs: 5,
        ..OrchestratorConfig::default()
    });
    h.orchestrator
        .execute(request("web", OperationKind::Create, "k1"))
        .await
        .unwrap();
    h.orchestrator
        .execute(request("web", OperationKind::Start, "k2"))
        .await
        .unwrap();

    h.driver.set_delay(DriverCall::Stop, Duration::from_secs(60));
    let err = h
        .orchestrator
        .execute(request("web", OperationKind::Stop, "k3"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DriverRecoverable);
    assert_eq!(err.state(), Some(LifecycleState::Failed));
    assert!(err.is_retryable());

    let record = h.store.get("web").await.unwrap().unwrap();
    assert_eq!(record.state(), LifecycleState::Failed);
    assert_eq!(record.generation(), 3);
    let detail = record.last_error().unwrap();
    assert_eq!(detail.failure, DriverFailure::Recoverable);
    assert_eq!(detail.operation, OperationKind::Stop);

    let destroyed = h
        .orchestrator
        .execute(request("web", OperationKind::Destroy, "k4"))
        .await
        .unwrap();
    assert_eq!(destroyed.state, LifecycleState::Absent);
    assert_eq!(destroyed.generation, 4);
    assert!(destroyed.container.last_error().is_none());
    assert_eq!(h.driver.observed("web"), ObservedState::Missing);
    assert!(h.orchestrator.list().await.unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_generation_moves_by_one_per_committed_change() {
    let h = harness();
    let steps = [
        OperationKind::Create,
        OperationKind::Start,
        OperationKind::Restart,
        OperationKind::Stop,
        OperationKind::Destroy,
        OperationKind::Create,
    ];

    for (i, kind) in steps.into_iter().enumerate() {
        let outcome = h
            .orchestrator
            .execute(OperationRequest::new("web", kind))
            .await
            .unwrap();
        assert_eq!(outcome.generation, i as u64 + 1, "after {kind}");
    }

    // Inspect is read-only
    let inspected = h
        .orchestrator
        .execute(OperationRequest::new("web", OperationKind::Inspect))
        .await
        .unwrap();
    assert_eq!(inspected.generation, steps.len() as u64);
    assert_eq!(inspected.state, LifecycleState::Stopped);
}

#[test_log::test(tokio::test)]
async fn test_idempotent_replay_calls_driver_once() {
    let h = harness();

    let first = h
        .orchestrator
        .execute(request("web", OperationKind::Create, "k1"))
        .await
        .unwrap();
    let second = h
        .orchestrator
        .execute(request("web", OperationKind::Create, "k1"))
        .await
        .unwrap();

    assert!(second.replayed);
    assert_eq!(second.state, first.state);
    assert_eq!(second.generation, first.generation);
    assert_eq!(h.driver.call_count(DriverCall::Create, "web"), 1);

    // A later replay still answers with the first result
    h.orchestrator
        .execute(request("web", OperationKind::Start, "k2"))
        .await
        .unwrap();
    let replay = h
        .orchestrator
        .execute(request("web", OperationKind::Create, "k1"))
        .await
        .unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.state, LifecycleState::Stopped);
    assert_eq!(replay.generation, 1);
    assert_eq!(replay.container.state(), LifecycleState::Running);
    assert_eq!(h.driver.call_count(DriverCall::Create, "web"), 1);
}

#[test_log::test(tokio::test)]
async fn test_failed_operation_is_not_replayed() {
    let h = harness();
    h.driver.fail_next(
        DriverCall::Create,
        DriverError::recoverable("host unreachable"),
    );

    let err = h
        .orchestrator
        .execute(request("web", OperationKind::Create, "k1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DriverRecoverable);
    assert_eq!(err.status_code(), 503);

    // The container is parked in Failed, so the retry is judged on its own
    let err = h
        .orchestrator
        .execute(request("web", OperationKind::Create, "k1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    assert_eq!(err.state(), Some(LifecycleState::Failed));
    assert_eq!(h.driver.call_count(DriverCall::Create, "web"), 1);
}

#[test_log::test(tokio::test)]
async fn test_terminal_driver_failure() {
    let h = harness();
    h.driver
        .fail_next(DriverCall::Create, DriverError::terminal("template not found"));

    let err = h
        .orchestrator
        .execute(request("web", OperationKind::Create, "k1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DriverTerminal);
    assert_eq!(err.status_code(), 502);
    assert!(!err.is_retryable());

    let record = h.store.get("web").await.unwrap().unwrap();
    assert_eq!(record.state(), LifecycleState::Failed);
    assert_eq!(
        record.last_error().map(|e| e.failure),
        Some(DriverFailure::Terminal)
    );
}

#[test_log::test(tokio::test)]
async fn test_concurrent_operations_are_serialized() {
    let h = harness();
    h.orchestrator
        .execute(request("web", OperationKind::Create, "k1"))
        .await
        .unwrap();
    h.driver
        .set_delay(DriverCall::Start, Duration::from_millis(20));

    let results = join_all((0..4).map(|i| {
        h.orchestrator
            .execute(request("web", OperationKind::Start, &format!("start-{i}")))
    }))
    .await;

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1);
    for err in results.into_iter().filter_map(Result::err) {
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(err.state(), Some(LifecycleState::Running));
    }

    let record = h.store.get("web").await.unwrap().unwrap();
    assert_eq!(record.generation(), 2);
    assert_eq!(h.driver.call_count(DriverCall::Start, "web"), 1);
    assert_eq!(h.orchestrator.locks().in_flight(), 0);
}

#[test_log::test(tokio::test)]
async fn test_distinct_containers_proceed_independently() {
    let h = harness();
    h.driver
        .set_delay(DriverCall::Create, Duration::from_millis(10));

    let results = join_all(
        ["a", "b", "c"]
            .into_iter()
            .map(|id| h.orchestrator.execute(OperationRequest::new(id, OperationKind::Create))),
    )
    .await;

    assert!(results.iter().all(Result::is_ok));
    let mut ids: Vec<String> = h
        .orchestrator
        .list()
        .await
        .unwrap()
        .iter()
        .map(|r| r.id().to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, ["a", "b", "c"]);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_lock_timeout() {
    let h = harness_with(OrchestratorConfig {
        lock_timeout_secs: 2,
        ..OrchestratorConfig::default()
    });
    h.orchestrator
        .execute(request("web", OperationKind::Create, "k1"))
        .await
        .unwrap();

    let _held = h.orchestrator.locks().acquire("web").await.unwrap();
    let err = h
        .orchestrator
        .execute(request("web", OperationKind::Start, "k2"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockTimeout);
    assert!(err.is_retryable());
    assert_eq!(h.driver.call_count(DriverCall::Start, "web"), 0);

    // Reads never wait for the lock
    let inspected = h
        .orchestrator
        .execute(OperationRequest::new("web", OperationKind::Inspect))
        .await
        .unwrap();
    assert_eq!(inspected.state, LifecycleState::Stopped);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_cancelled_caller_still_records_outcome() {
    let h = harness();
    h.driver
        .set_delay(DriverCall::Create, Duration::from_secs(3));

    let call = h
        .orchestrator
        .execute(request("web", OperationKind::Create, "k1"));
    assert!(tokio::time::timeout(Duration::from_secs(1), call)
        .await
        .is_err());

    let record = h.store.get("web").await.unwrap().unwrap();
    assert_eq!(record.state(), LifecycleState::Creating);

    tokio::time::sleep(Duration::from_secs(5)).await;

    let record = h.store.get("web").await.unwrap().unwrap();
    assert_eq!(record.state(), LifecycleState::Stopped);
    assert_eq!(record.generation(), 1);
    assert!(record.find_completed("k1", OperationKind::Create).is_some());
    assert_eq!(h.orchestrator.locks().in_flight(), 0);

    // The retry from the impatient caller is a replay
    let retry = h
        .orchestrator
        .execute(request("web", OperationKind::Create, "k1"))
        .await
        .unwrap();
    assert!(retry.replayed);
    assert_eq!(h.driver.call_count(DriverCall::Create, "web"), 1);
}

#[test_log::test(tokio::test)]
async fn test_inspect_reports_drift_and_driver_errors() {
    let h = harness();
    h.orchestrator
        .execute(OperationRequest::new("web", OperationKind::Create))
        .await
        .unwrap();
    h.orchestrator
        .execute(OperationRequest::new("web", OperationKind::Start))
        .await
        .unwrap();

    let healthy = h
        .orchestrator
        .execute(OperationRequest::new("web", OperationKind::Inspect))
        .await
        .unwrap();
    assert_eq!(healthy.observed, Some(ObservedState::Running));
    assert!(healthy.warning.is_none());

    h.driver.set_observed("web", ObservedState::Stopped);
    let drifted = h
        .orchestrator
        .execute(OperationRequest::new("web", OperationKind::Inspect))
        .await
        .unwrap();
    assert_eq!(drifted.state, LifecycleState::Running);
    assert_eq!(drifted.observed, Some(ObservedState::Stopped));
    assert!(drifted.warning.is_some());

    h.driver
        .fail_next(DriverCall::Inspect, DriverError::recoverable("timeout"));
    let stale = h
        .orchestrator
        .execute(OperationRequest::new("web", OperationKind::Inspect))
        .await
        .unwrap();
    assert_eq!(stale.state, LifecycleState::Running);
    assert_eq!(stale.observed, None);
    assert!(stale.warning.unwrap().contains("timeout"));

    // None of this was written back
    let record = h.store.get("web").await.unwrap().unwrap();
    assert_eq!(record.generation(), 2);
}

#[test_log::test(tokio::test)]
async fn test_unknown_container_is_not_found() {
    let h = harness();

    for kind in [
        OperationKind::Start,
        OperationKind::Stop,
        OperationKind::Destroy,
        OperationKind::Inspect,
    ] {
        let err = h
            .orchestrator
            .execute(OperationRequest::new("ghost", kind))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound, "{kind}");
        assert_eq!(err.status_code(), 404);
    }
    assert!(h.store.get("ghost").await.unwrap().is_none());
    assert!(h.driver.calls().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_invalid_spec_writes_nothing() {
    let h = harness();

    let mut spec = ContainerSpec::new("local:vztmpl/alpine.tar.zst");
    spec.cores = 0;
    let err = h
        .orchestrator
        .execute(OperationRequest::new("web", OperationKind::Create).with_spec(spec))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSpec);
    assert_eq!(err.status_code(), 422);

    let err = h
        .orchestrator
        .execute(OperationRequest::new("", OperationKind::Create))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSpec);

    assert!(h.store.get("web").await.unwrap().is_none());
    assert!(h.driver.calls().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_create_uses_given_or_default_spec() {
    let h = harness();

    let mut spec = ContainerSpec::new("local:vztmpl/alpine.tar.zst");
    spec.cores = 4;
    spec.memory_mb = 2048;
    let custom = h
        .orchestrator
        .execute(OperationRequest::new("custom", OperationKind::Create).with_spec(spec.clone()))
        .await
        .unwrap();
    assert_eq!(custom.container.spec(), &spec);

    let default = h
        .orchestrator
        .execute(OperationRequest::new("plain", OperationKind::Create))
        .await
        .unwrap();
    assert_eq!(
        default.container.spec().template,
        OrchestratorConfig::default().default_template
    );
    assert_eq!(default.container.spec().cores, 1);
}

#[test_log::test(tokio::test)]
async fn test_restart_goes_through_starting() {
    let h = harness();
    h.orchestrator
        .execute(OperationRequest::new("web", OperationKind::Create))
        .await
        .unwrap();

    let err = h
        .orchestrator
        .execute(OperationRequest::new("web", OperationKind::Restart))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);

    h.orchestrator
        .execute(OperationRequest::new("web", OperationKind::Start))
        .await
        .unwrap();
    let restarted = h
        .orchestrator
        .execute(OperationRequest::new("web", OperationKind::Restart))
        .await
        .unwrap();
    assert_eq!(restarted.state, LifecycleState::Running);
    assert_eq!(restarted.generation, 3);
    assert_eq!(h.driver.call_count(DriverCall::Restart, "web"), 1);
}

#[test_log::test(tokio::test)]
async fn test_two_instances_sharing_a_store_do_not_take_over_each_other() {
    let store = Arc::new(MemoryStore::new());
    let driver = Arc::new(MockDriver::new());
    let first = Orchestrator::new(store.clone(), driver.clone(), OrchestratorConfig::default());
    let second = Orchestrator::new(store.clone(), driver.clone(), OrchestratorConfig::default());

    first
        .execute(request("web", OperationKind::Create, "k1"))
        .await
        .unwrap();
    driver.set_delay(DriverCall::Start, Duration::from_millis(300));

    let running = tokio::spawn({
        let first = first.clone();
        async move { first.execute(request("web", OperationKind::Start, "ka")).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        store.get("web").await.unwrap().unwrap().state(),
        LifecycleState::Starting
    );

    let err = second
        .execute(request("web", OperationKind::Start, "kb"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreConflict);
    assert_eq!(err.state(), Some(LifecycleState::Starting));

    let started = running.await.unwrap().unwrap();
    assert_eq!(started.state, LifecycleState::Running);
    assert_eq!(started.generation, 2);
    assert_eq!(driver.call_count(DriverCall::Start, "web"), 1);

    // Once the first instance has committed, the second one proceeds normally
    let stopped = second
        .execute(request("web", OperationKind::Stop, "kc"))
        .await
        .unwrap();
    assert_eq!(stopped.state, LifecycleState::Stopped);
    assert_eq!(stopped.generation, 3);
}
