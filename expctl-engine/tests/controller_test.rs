//! End-to-end behavior of the experiment controller.

mod common;

use std::time::{Duration, Instant};

use common::{HOST, Journal, SERVICE, event, fast_config, test_registry};
use expctl_engine::drivers::{APPLICATION, ERROR_APPLICATION, NODE, STDOUT_TRACE, dummy_registry};
use expctl_engine::scheduler::{TaskId, TaskSnapshot, TaskStatus};
use expctl_engine::{ExperimentController, FailureLevel};
use expctl_shared::errors::ControllerError;
use expctl_shared::{AttrValue, ResourceAction, ResourceState, TimeSpecError, ValidationError};
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_design_attribute_lifecycle_end_to_end() {
    let ec = ExperimentController::new(fast_config(), dummy_registry()).unwrap();
    let a = ec.register_resource(NODE).await.unwrap();
    let b = ec.register_resource(APPLICATION).await.unwrap();
    ec.register_connection(b, a).await.unwrap();

    ec.set(a, "hostname", "node-a").await.unwrap();
    ec.deploy().await.unwrap();

    let deployed = ec.wait_deployed(&[a]).await.unwrap();
    assert_eq!(deployed.reached, vec![a]);
    let err = ec.set(a, "hostname", "node-b").await.unwrap_err();
    assert!(matches!(
        err,
        ControllerError::Validation(ValidationError::DesignOnly { .. })
    ));
    assert_eq!(
        ec.get(a, "hostname").await.unwrap(),
        Some(AttrValue::from("node-a"))
    );

    let started = ec.wait_started(&[a, b]).await.unwrap();
    assert!(started.is_success());
    assert_eq!(started.reached, vec![a, b]);
    assert_eq!(ec.failure_level().await.unwrap(), FailureLevel::Ok);

    let report = ec.shutdown().await.unwrap();
    assert_eq!(report.states[&a], ResourceState::Released);
    assert_eq!(report.states[&b], ResourceState::Released);
    assert!(report.all_released());
    assert_eq!(ec.pending_tasks(), 0);

    // the controller is gone, but a second shutdown still answers
    assert!(matches!(ec.state(a).await, Err(ControllerError::ShutDown)));
    assert_eq!(ec.shutdown().await.unwrap().released.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_start_condition_holds_regardless_of_registration_order() {
    for dependency_first in [true, false] {
        let journal = Journal::default();
        let ec = ExperimentController::new(fast_config(), test_registry(&journal)).unwrap();

        let (waiting, dependency) = if dependency_first {
            let dependency = ec.register_resource(HOST).await.unwrap();
            (ec.register_resource(HOST).await.unwrap(), dependency)
        } else {
            let waiting = ec.register_resource(HOST).await.unwrap();
            (waiting, ec.register_resource(HOST).await.unwrap())
        };
        ec.set(dependency, "latency", "100ms").await.unwrap();
        ec.register_condition(
            [waiting],
            ResourceAction::Start,
            [dependency],
            ResourceState::Started,
            None,
        )
        .await
        .unwrap();

        ec.deploy().await.unwrap();
        let report = ec.wait_started(&[waiting, dependency]).await.unwrap();
        assert!(report.is_success());

        let dependency_started = journal.position(&event("end", "start", dependency)).unwrap();
        let waiting_began = journal.position(&event("begin", "start", waiting)).unwrap();
        assert!(
            waiting_began > dependency_started,
            "start ran early: {:?}",
            journal.events()
        );
        ec.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_condition_delay_is_added_after_target_state() {
    let journal = Journal::default();
    let ec = ExperimentController::new(fast_config(), test_registry(&journal)).unwrap();
    let first = ec.register_resource(HOST).await.unwrap();
    let second = ec.register_resource(HOST).await.unwrap();
    ec.register_condition(
        [second],
        ResourceAction::Start,
        [first],
        ResourceState::Started,
        Some(Duration::from_millis(300)),
    )
    .await
    .unwrap();

    ec.deploy().await.unwrap();
    ec.wait_started(&[first, second]).await.unwrap();

    let first_started = journal.time_of(&event("end", "start", first)).unwrap();
    let second_began = journal.time_of(&event("begin", "start", second)).unwrap();
    assert!(second_began.duration_since(first_started) >= Duration::from_millis(300));
    ec.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_requirement_orders_deployment() {
    let journal = Journal::default();
    let ec = ExperimentController::new(fast_config(), test_registry(&journal)).unwrap();
    let service = ec.register_resource(SERVICE).await.unwrap();
    let host = ec.register_resource(HOST).await.unwrap();
    ec.register_connection(service, host).await.unwrap();
    ec.set(host, "latency", "50ms").await.unwrap();

    assert!(matches!(
        ec.register_connection(service, service).await,
        Err(ControllerError::IllegalConnection { .. })
    ));

    ec.deploy().await.unwrap();
    ec.wait_deployed(&[service, host]).await.unwrap();

    let host_ready = journal.position(&event("end", "deploy", host)).unwrap();
    let service_deploy = journal.position(&event("begin", "deploy", service)).unwrap();
    assert!(service_deploy > host_ready, "{:?}", journal.events());
    assert_eq!(ec.get_connected(host, Some(SERVICE)).await.unwrap(), vec![service]);
    ec.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_critical_failure_propagates_to_dependents() {
    let ec = ExperimentController::new(fast_config(), dummy_registry()).unwrap();
    let node = ec.register_resource(NODE).await.unwrap();
    let broken = ec.register_resource(ERROR_APPLICATION).await.unwrap();
    let app = ec.register_resource(APPLICATION).await.unwrap();
    ec.register_connection(broken, node).await.unwrap();
    ec.register_connection(app, node).await.unwrap();
    ec.register_condition(
        [app],
        ResourceAction::Start,
        [broken],
        ResourceState::Started,
        None,
    )
    .await
    .unwrap();

    ec.deploy().await.unwrap();
    let report = ec.wait_started(&[broken, app]).await.unwrap();
    assert_eq!(report.failed, vec![broken, app]);
    assert_eq!(ec.state(broken).await.unwrap(), ResourceState::Failed);
    assert_eq!(ec.failure_level().await.unwrap(), FailureLevel::ResourceFailure);

    let info = ec.resource_info(broken).await.unwrap();
    assert!(info.last_error.unwrap().contains("failed on purpose"));
    assert!(info.timestamps.contains_key("failed_time"));

    let shutdown = ec.shutdown().await.unwrap();
    assert!(shutdown.all_released());
    assert_eq!(shutdown.failure_level, FailureLevel::ResourceFailure);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_non_critical_failure_is_tolerated() {
    let ec = ExperimentController::new(fast_config(), dummy_registry()).unwrap();
    let node = ec.register_resource(NODE).await.unwrap();
    let broken = ec.register_resource(ERROR_APPLICATION).await.unwrap();
    let app = ec.register_resource(APPLICATION).await.unwrap();
    ec.register_connection(broken, node).await.unwrap();
    ec.register_connection(app, node).await.unwrap();
    ec.set(broken, "critical", false).await.unwrap();

    ec.deploy().await.unwrap();
    let report = ec.wait_started(&[node, app]).await.unwrap();
    assert_eq!(report.reached, vec![node, app]);
    let report = ec.wait_started(&[broken]).await.unwrap();
    assert_eq!(report.failed, vec![broken]);
    assert_eq!(ec.failure_level().await.unwrap(), FailureLevel::Ok);
    ec.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_release_failure_does_not_stop_shutdown() {
    let journal = Journal::default();
    let ec = ExperimentController::new(fast_config(), test_registry(&journal)).unwrap();
    let first = ec.register_resource(HOST).await.unwrap();
    let second = ec.register_resource(HOST).await.unwrap();
    ec.set(first, "fail_on", "release").await.unwrap();

    ec.deploy().await.unwrap();
    ec.wait_started(&[first, second]).await.unwrap();

    let report = ec.shutdown().await.unwrap();
    assert!(report.all_released());
    assert_eq!(report.released, vec![first, second]);
    assert_eq!(report.failure_level, FailureLevel::ResourceFailure);
    assert!(journal.position(&event("end", "release", second)).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_self_stopping_application_and_trace() {
    let ec = ExperimentController::new(fast_config(), dummy_registry()).unwrap();
    let node = ec.register_resource(NODE).await.unwrap();
    let app = ec.register_resource(APPLICATION).await.unwrap();
    ec.register_connection(app, node).await.unwrap();
    ec.set(app, "command", "echo hello").await.unwrap();
    ec.set(app, "duration", "100ms").await.unwrap();
    ec.enable_trace(app, STDOUT_TRACE).await.unwrap();
    assert!(matches!(
        ec.enable_trace(app, "stderr").await,
        Err(ControllerError::UnknownTrace { .. })
    ));

    ec.deploy().await.unwrap();
    let report = ec.wait_finished(&[app]).await.unwrap();
    assert_eq!(report.reached, vec![app]);
    assert_eq!(ec.state(app).await.unwrap(), ResourceState::Stopped);
    assert_eq!(ec.get(app, "exit_code").await.unwrap(), Some(AttrValue::Integer(0)));

    let stdout = ec.trace(app, STDOUT_TRACE).await.unwrap();
    assert!(stdout.contains("$ echo hello"));
    assert!(stdout.contains("exited with status 0"));
    ec.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deferred_set_waits_for_condition() {
    let ec = ExperimentController::new(fast_config(), dummy_registry()).unwrap();
    let node = ec.register_resource(NODE).await.unwrap();
    let app = ec.register_resource(APPLICATION).await.unwrap();
    ec.register_connection(app, node).await.unwrap();
    ec.register_condition([app], ResourceAction::Set, [node], ResourceState::Started, None)
        .await
        .unwrap();

    ec.set_deferred(app, "duration", "5s").await.unwrap();
    assert_eq!(ec.get(app, "duration").await.unwrap(), None);

    ec.deploy().await.unwrap();
    ec.wait_started(&[node]).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if ec.get(app, "duration").await.unwrap() == Some(AttrValue::from("5s")) {
            break;
        }
        assert!(Instant::now() < deadline, "deferred set never applied");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    ec.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_explicit_release_and_shared_handles() {
    let ec = ExperimentController::new(fast_config(), dummy_registry()).unwrap();
    let first = ec.register_resource(NODE).await.unwrap();
    let second = ec.register_resource(NODE).await.unwrap();
    for node in [first, second] {
        ec.set(node, "username", "alice").await.unwrap();
        ec.set(node, "password", "secret").await.unwrap();
    }
    let info = ec.resource_info(first).await.unwrap();
    assert_eq!(info.attributes["password"], "***");

    ec.deploy().await.unwrap();
    ec.wait_deployed(&[first, second]).await.unwrap();
    let credentials = ["dummy", "alice", "secret"];
    assert_eq!(ec.handles().holders(&credentials), 2);

    ec.release(first).await.unwrap();
    let report = ec.wait(&[first], ResourceState::Released).await.unwrap();
    assert_eq!(report.reached, vec![first]);
    assert_eq!(ec.handles().holders(&credentials), 1);
    assert!(matches!(
        ec.start(first).await,
        Err(ControllerError::InvalidTransition { .. })
    ));

    let shutdown = ec.shutdown().await.unwrap();
    assert_eq!(shutdown.released, vec![second]);
    assert!(ec.handles().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_global_defaults_apply_to_later_resources() {
    let ec = ExperimentController::new(fast_config(), dummy_registry()).unwrap();
    let before = ec.register_resource(NODE).await.unwrap();
    ec.set_global(NODE, "hostname", "shared-host").await.unwrap();
    let after = ec.register_resource(NODE).await.unwrap();

    assert_eq!(ec.get(before, "hostname").await.unwrap(), None);
    assert_eq!(
        ec.get(after, "hostname").await.unwrap(),
        Some(AttrValue::from("shared-host"))
    );
    assert!(ec.set_global(NODE, "password", "secret").await.is_err());
    assert!(matches!(
        ec.register_resource("dummy::Unknown").await,
        Err(ControllerError::UnknownType { .. })
    ));
    ec.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_design_round_trip_between_controllers() {
    let ec = ExperimentController::new(fast_config(), dummy_registry()).unwrap();
    let node = ec.register_resource(NODE).await.unwrap();
    let app = ec.register_resource(APPLICATION).await.unwrap();
    ec.register_connection(app, node).await.unwrap();
    ec.set(node, "hostname", "replayed").await.unwrap();
    ec.register_condition([app], ResourceAction::Start, [node], ResourceState::Started, None)
        .await
        .unwrap();
    let design = ec.design().await.unwrap();
    ec.shutdown().await.unwrap();

    let replay = ExperimentController::from_design(fast_config(), dummy_registry(), &design)
        .await
        .unwrap();
    assert_eq!(replay.resources().await.unwrap(), vec![node, app]);
    assert_eq!(
        replay.get(node, "hostname").await.unwrap(),
        Some(AttrValue::from("replayed"))
    );
    assert_eq!(replay.get_connected(app, None).await.unwrap(), vec![node]);
    assert_eq!(replay.design().await.unwrap().conditions, design.conditions);
    replay.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wait_times_out() {
    let config = fast_config().with_wait_timeout(Duration::from_millis(100));
    let ec = ExperimentController::new(config, dummy_registry()).unwrap();
    let node = ec.register_resource(NODE).await.unwrap();

    // never deployed, so it can never start
    assert!(matches!(
        ec.wait_started(&[node]).await,
        Err(ControllerError::WaitTimeout { .. })
    ));
    ec.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_oversized_delays_are_rejected() {
    let config = fast_config().with_wait_timeout(Duration::MAX);
    let ec = ExperimentController::new(config, dummy_registry()).unwrap();
    let node = ec.register_resource(NODE).await.unwrap();
    let other = ec.register_resource(NODE).await.unwrap();

    assert!(matches!(
        ec.schedule(Duration::MAX, true, || Ok(json!(null))),
        Err(ControllerError::TimeSpec(TimeSpecError::OutOfRange { .. }))
    ));
    assert!(matches!(
        ec.register_condition(
            [other],
            ResourceAction::Start,
            [node],
            ResourceState::Started,
            Some(Duration::MAX),
        )
        .await,
        Err(ControllerError::TimeSpec(TimeSpecError::OutOfRange { .. }))
    ));

    // an unbounded wait timeout still lets the wait finish
    ec.deploy().await.unwrap();
    let report = ec.wait_started(&[node, other]).await.unwrap();
    assert_eq!(report.reached.len(), 2);
    assert!(report.failed.is_empty());
    ec.shutdown().await.unwrap();
}

async fn settled(ec: &ExperimentController, id: TaskId) -> TaskSnapshot {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let task = ec.get_task(id).unwrap();
        if task.status != TaskStatus::New {
            return task;
        }
        assert!(Instant::now() < deadline, "task {:?} never ran", id);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scheduled_tasks() {
    let ec = ExperimentController::new(fast_config(), dummy_registry()).unwrap();

    let scheduled_at = Instant::now();
    let answer = ec
        .schedule(Duration::from_millis(100), true, move || {
            Ok(json!(scheduled_at.elapsed().as_millis() as u64))
        })
        .unwrap();
    let task = settled(&ec, answer).await;
    assert_eq!(task.status, TaskStatus::Done);
    let ran_after = task.result.as_ref().and_then(|v| v.as_u64()).unwrap();
    assert!(ran_after >= 100, "callback ran after only {}ms", ran_after);
    assert_eq!(ec.failure_level().await.unwrap(), FailureLevel::Ok);

    let broken = ec
        .schedule(Duration::ZERO, true, || anyhow::bail!("callback exploded"))
        .unwrap();
    let task = settled(&ec, broken).await;
    assert_eq!(task.status, TaskStatus::Error);
    assert!(task.error.unwrap().to_string().contains("callback exploded"));
    assert_eq!(ec.failure_level().await.unwrap(), FailureLevel::TaskFailure);

    // a failed callback does not stop later ones
    let untracked = ec.schedule(Duration::ZERO, false, || Ok(json!(null))).unwrap();
    let after = ec.schedule(Duration::from_millis(20), true, || Ok(json!("still running"))).unwrap();
    assert_eq!(settled(&ec, after).await.status, TaskStatus::Done);
    assert!(ec.get_task(untracked).is_none());

    let cancelled = ec
        .schedule(Duration::from_secs(60), true, || Ok(json!(null)))
        .unwrap();
    assert!(ec.cancel_task(cancelled));
    assert!(!ec.cancel_task(cancelled));

    ec.shutdown().await.unwrap();
    assert_eq!(ec.pending_tasks(), 0);
}
