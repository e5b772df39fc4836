//! Lifecycle manager and fleet tests

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use runner_manager::errors::ManagerError;
use runner_manager::lifecycle::fleet::Fleet;
use runner_manager::lifecycle::fsm::{is_valid_path, RunnerState};
use runner_manager::lifecycle::manager::OperationOutcome;
use runner_manager::notify::events::EventKind;
use runner_manager::runtime::{ContainerRuntime, RuntimeState};

use crate::fakes::{drain, kinds, lifecycle, php83, plain, FakeRuntime};

#[tokio::test]
async fn test_create_uses_lowest_free_slot_and_respects_capacity() {
    let runtime = FakeRuntime::new();
    let (manager, _rx) = lifecycle(runtime);
    let definition = plain(2);

    let first = manager.create(&definition).await.unwrap();
    let second = manager.create(&definition).await.unwrap();
    assert_eq!(first.id, "my-runner-plain-1");
    assert_eq!(second.id, "my-runner-plain-2");
    assert_eq!(first.state(), RunnerState::Created);

    let err = manager.create(&definition).await.unwrap_err();
    assert!(matches!(err, ManagerError::CapacityConflict(_)));
}

#[tokio::test]
async fn test_start_registers_and_notifies() {
    let runtime = FakeRuntime::new();
    let (manager, mut rx) = lifecycle(runtime.clone());
    let definition = php83();

    let instance = manager.create(&definition).await.unwrap();
    let outcome = manager.start(&instance.id).await.unwrap();
    assert_eq!(
        outcome,
        OperationOutcome::Done {
            state: RunnerState::Started
        }
    );

    assert_eq!(runtime.state_of(&instance.id), Some(RuntimeState::Running));
    assert_eq!(
        runtime.image_of(&instance.id).as_deref(),
        Some("itroom/php:8.3-2.328.0")
    );

    let events = drain(&mut rx);
    assert_eq!(kinds(&events), vec![EventKind::RunnerStarted]);
    assert_eq!(events[0].get_str("runner_id"), Some("php83-1"));
    assert_eq!(events[0].get_str("runner_name"), Some("my-runner-php83-1"));
}

#[tokio::test]
async fn test_start_failure_moves_to_error() {
    let runtime = FakeRuntime::new();
    runtime.fail_start_of("my-runner-plain-1");
    let (manager, mut rx) = lifecycle(runtime);

    let instance = manager.create(&plain(1)).await.unwrap();
    let err = manager.start(&instance.id).await.unwrap_err();
    assert!(err.is_transient());

    let instance = manager.get(&instance.id).await.unwrap();
    assert_eq!(instance.state(), RunnerState::Error);
    assert!(instance.last_error().unwrap().contains("daemon unavailable"));
    assert_eq!(kinds(&drain(&mut rx)), vec![EventKind::RunnerError]);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let runtime = FakeRuntime::new();
    let (manager, mut rx) = lifecycle(runtime.clone());

    let instance = manager.create(&plain(1)).await.unwrap();
    manager.start(&instance.id).await.unwrap();
    drain(&mut rx);

    let first = manager.stop(&instance.id).await.unwrap();
    assert_eq!(
        first,
        OperationOutcome::Done {
            state: RunnerState::Stopped
        }
    );
    assert_eq!(runtime.state_of(&instance.id), Some(RuntimeState::Exited));

    let second = manager.stop(&instance.id).await.unwrap();
    assert!(matches!(second, OperationOutcome::Skipped { .. }));

    let events = drain(&mut rx);
    assert_eq!(
        kinds(&events),
        vec![EventKind::RunnerStopped, EventKind::RunnerSkipped]
    );
    assert_eq!(events[1].get_str("reason"), Some("Not running"));
}

#[tokio::test]
async fn test_stop_of_created_is_a_conflict() {
    let runtime = FakeRuntime::new();
    let (manager, _rx) = lifecycle(runtime);

    let instance = manager.create(&plain(1)).await.unwrap();
    let err = manager.stop(&instance.id).await.unwrap_err();
    assert!(matches!(err, ManagerError::StateConflict { .. }));
}

#[tokio::test]
async fn test_remove_retires_the_id() {
    let runtime = FakeRuntime::new();
    let (manager, mut rx) = lifecycle(runtime.clone());

    let instance = manager.create(&plain(1)).await.unwrap();
    manager.start(&instance.id).await.unwrap();
    manager.stop(&instance.id).await.unwrap();
    manager.remove(&instance.id, false).await.unwrap();
    drain(&mut rx);

    assert_eq!(runtime.state_of(&instance.id), None);
    assert_eq!(runtime.removed.lock().unwrap().as_slice(), &[instance.id.clone()]);
    assert!(matches!(
        manager.get(&instance.id).await,
        Err(ManagerError::NotFound(_))
    ));

    // stop and remove on a removed runner are skips, start is a conflict
    assert!(matches!(
        manager.stop(&instance.id).await.unwrap(),
        OperationOutcome::Skipped { .. }
    ));
    assert!(matches!(
        manager.remove(&instance.id, false).await.unwrap(),
        OperationOutcome::Skipped { .. }
    ));
    assert!(matches!(
        manager.start(&instance.id).await,
        Err(ManagerError::StateConflict { .. })
    ));
    assert!(matches!(
        manager.mark_error(&instance.id, "late").await,
        Err(ManagerError::StateConflict { .. })
    ));
    assert_eq!(
        kinds(&drain(&mut rx)),
        vec![EventKind::RunnerSkipped, EventKind::RunnerSkipped]
    );

    // The slot can be reused
    let again = manager.create(&plain(1)).await.unwrap();
    assert_eq!(again.id, instance.id);
    assert_eq!(again.state(), RunnerState::Created);
}

#[tokio::test(start_paused = true)]
async fn test_operations_on_one_runner_are_serialized() {
    let runtime = FakeRuntime::new();
    let (manager, mut rx) = lifecycle(runtime.clone());

    let instance = manager.create(&plain(1)).await.unwrap();
    manager.start(&instance.id).await.unwrap();
    drain(&mut rx);
    runtime.slow_down(Duration::from_secs(10));

    let stopping = tokio::spawn({
        let manager = manager.clone();
        let id = instance.id.clone();
        async move { manager.stop(&id).await }
    });
    // Let the stop take the runner and reach the runtime
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(runtime.state_of(&instance.id), Some(RuntimeState::Running));

    // Waits for the stop, then starts from `stopped`
    let started = manager.start(&instance.id).await.unwrap();
    assert_eq!(
        started,
        OperationOutcome::Done {
            state: RunnerState::Started
        }
    );
    assert_eq!(
        stopping.await.unwrap().unwrap(),
        OperationOutcome::Done {
            state: RunnerState::Stopped
        }
    );

    assert_eq!(manager.get(&instance.id).await.unwrap().state(), RunnerState::Started);
    assert_eq!(runtime.state_of(&instance.id), Some(RuntimeState::Running));

    let events = drain(&mut rx);
    assert_eq!(
        kinds(&events),
        vec![EventKind::RunnerStopped, EventKind::RunnerStarted]
    );
    assert_eq!(events[1].payload.get("restarted"), Some(&Value::Bool(true)));
}

#[tokio::test(start_paused = true)]
async fn test_stop_and_remove_racing_a_removal_are_skipped() {
    let runtime = FakeRuntime::new();
    let (manager, mut rx) = lifecycle(runtime.clone());

    let instance = manager.create(&plain(1)).await.unwrap();
    manager.start(&instance.id).await.unwrap();
    manager.stop(&instance.id).await.unwrap();
    drain(&mut rx);
    runtime.slow_down(Duration::from_secs(10));

    let removing = tokio::spawn({
        let manager = manager.clone();
        let id = instance.id.clone();
        async move { manager.remove(&id, false).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;

    let (stopped, removed) = tokio::join!(
        manager.stop(&instance.id),
        manager.remove(&instance.id, false)
    );
    assert!(matches!(stopped.unwrap(), OperationOutcome::Skipped { .. }));
    assert!(matches!(removed.unwrap(), OperationOutcome::Skipped { .. }));
    assert_eq!(
        removing.await.unwrap().unwrap(),
        OperationOutcome::Done {
            state: RunnerState::Removed
        }
    );

    // Once retired the id keeps reporting skips, never NotFound
    assert!(matches!(
        manager.stop(&instance.id).await.unwrap(),
        OperationOutcome::Skipped { .. }
    ));
    assert_eq!(runtime.removed.lock().unwrap().len(), 1);

    let events = kinds(&drain(&mut rx));
    assert_eq!(events[0], EventKind::RunnerRemoved);
    assert_eq!(
        events[1..],
        [
            EventKind::RunnerSkipped,
            EventKind::RunnerSkipped,
            EventKind::RunnerSkipped
        ]
    );
}

#[tokio::test]
async fn test_remove_requires_stop() {
    let runtime = FakeRuntime::new();
    let (manager, _rx) = lifecycle(runtime);

    let instance = manager.create(&plain(1)).await.unwrap();
    manager.start(&instance.id).await.unwrap();
    assert!(matches!(
        manager.remove(&instance.id, false).await,
        Err(ManagerError::StateConflict { .. })
    ));
}

#[tokio::test]
async fn test_unknown_id_is_not_found() {
    let runtime = FakeRuntime::new();
    let (manager, _rx) = lifecycle(runtime);

    assert!(matches!(
        manager.start("ghost-1").await,
        Err(ManagerError::NotFound(_))
    ));
    assert!(matches!(
        manager.stop("ghost-1").await,
        Err(ManagerError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_liveness_promotes_and_fails() {
    let runtime = FakeRuntime::new();
    let (manager, mut rx) = lifecycle(runtime.clone());
    let definition = plain(2);

    let one = manager.create(&definition).await.unwrap();
    let two = manager.create(&definition).await.unwrap();
    manager.start(&one.id).await.unwrap();
    manager.start(&two.id).await.unwrap();
    drain(&mut rx);

    runtime.set_state(&two.id, RuntimeState::Exited);
    let changed = manager.probe_liveness().await;
    assert_eq!(
        changed,
        vec![
            (one.id.clone(), RunnerState::Running),
            (two.id.clone(), RunnerState::Error),
        ]
    );

    assert_eq!(kinds(&drain(&mut rx)), vec![EventKind::RunnerError]);
    let two = manager.get(&two.id).await.unwrap();
    assert_eq!(two.last_error(), Some("container exited"));
    assert!(is_valid_path(two.history()));

    // Nothing changes on a second probe
    assert!(manager.probe_liveness().await.is_empty());
}

#[tokio::test]
async fn test_discover_adopts_existing_containers() {
    let runtime = FakeRuntime::new();
    runtime.seed("my-runner-plain-1", RuntimeState::Running);
    runtime.seed("my-runner-plain-2", RuntimeState::Exited);
    runtime.seed("my-runner-plain-3", RuntimeState::Running);
    runtime.seed("my-runner-plainx-1", RuntimeState::Running);
    let (manager, mut rx) = lifecycle(runtime);

    let extras = manager.discover(&plain(2)).await.unwrap();
    assert_eq!(extras, vec![(3, "my-runner-plain-3".to_string())]);

    let states: Vec<_> = manager
        .list()
        .await
        .into_iter()
        .map(|i| {
            let state = i.state();
            (i.id, state)
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ("my-runner-plain-1".to_string(), RunnerState::Running),
            ("my-runner-plain-2".to_string(), RunnerState::Stopped),
            ("my-runner-plain-3".to_string(), RunnerState::Running),
        ]
    );

    // Adoption is silent
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_fleet_start_all_scales_to_count() {
    let runtime = FakeRuntime::new();
    runtime.seed("my-runner-plain-1", RuntimeState::Exited);
    runtime.seed("my-runner-plain-4", RuntimeState::Running);
    let (manager, _rx) = lifecycle(runtime.clone());
    let fleet = Fleet::new(manager.clone());

    let report = fleet.start_all(&[plain(2)]).await;
    assert!(!report.has_errors(), "{:?}", report.errors);

    let names = |refs: &[runner_manager::lifecycle::fleet::RunnerRef]| {
        refs.iter().map(|r| r.name.clone()).collect::<Vec<_>>()
    };
    assert_eq!(names(&report.restarted), vec!["my-runner-plain-1"]);
    assert_eq!(names(&report.started), vec!["my-runner-plain-2"]);
    assert_eq!(names(&report.removed), vec!["my-runner-plain-4"]);
    assert_eq!(runtime.state_of("my-runner-plain-4"), None);

    // Second run finds everything up
    let report = fleet.start_all(&[plain(2)]).await;
    assert_eq!(report.running.len(), 2);
    assert!(report.started.is_empty());

    let listing = fleet.listing(&[plain(2)]).await.unwrap();
    assert_eq!(listing.total_count, 2);
    assert_eq!(listing.total_running, 2);
    assert!(listing.groups[0].extra_runners.is_empty());
}

#[tokio::test]
async fn test_fleet_stop_and_remove_all() {
    let runtime = FakeRuntime::new();
    let (manager, _rx) = lifecycle(runtime.clone());
    let fleet = Arc::new(Fleet::new(manager.clone()));
    let definitions = [plain(2)];

    fleet.start_all(&definitions).await;

    let report = fleet.stop_all(&definitions).await;
    assert_eq!(report.stopped.len(), 2);
    let report = fleet.stop_all(&definitions).await;
    assert_eq!(report.skipped.len(), 2);

    let report = fleet.remove_all(&definitions).await;
    assert_eq!(report.removed.len(), 2);
    assert!(manager.list().await.is_empty());
    assert!(runtime.list("my-runner-plain-").await.unwrap().is_empty());
}
