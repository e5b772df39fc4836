//! Schedule engine tests

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, Weekday};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

use runner_manager::config::schedule::{Action, ScheduleConfig, TimeWindow};
use runner_manager::config::store::{ConfigStore, YamlConfigStore};
use runner_manager::lifecycle::fsm::RunnerState;
use runner_manager::lifecycle::manager::AgentLifecycleManager;
use runner_manager::notify::dispatcher;
use runner_manager::notify::events::{EventKind, NotificationEvent};
use runner_manager::runtime::ExternalTimeouts;
use runner_manager::scheduler::engine::{EngineDeps, ScheduleEngine, TickOutcome};
use runner_manager::scheduler::gate::{Clock, GateDecision};
use runner_manager::scheduler::state::{ActionOutcome, EngineStatus};
use runner_manager::update::checker::ImageUpdateChecker;
use runner_manager::workers::scheduler;

use crate::fakes::{drain, kinds, lifecycle_with, FakeBuilder, FakeRegistry, FakeRuntime};

const CONFIG: &str = r#"
runners_defaults:
  base_image: ghcr.io/actions/actions-runner:2.328.0
  org_url: https://github.com/itroom
runners:
  - id: php83
    name_prefix: my-runner-php83
    nb: 2
    build_image: ./config/Dockerfile.php83
    techno: php
    techno_version: 8.3
"#;

/// A group running the base image as is, without a Dockerfile
const PLAIN_BASE: &str = r#"
runners_defaults:
  base_image: X:1.0
  org_url: https://github.com/itroom
runners:
  - id: php83
    name_prefix: my-runner-php83
    nb: 2
"#;

const TWO_BASES: &str = r#"
runners_defaults:
  base_image: ghcr.io/actions/actions-runner:2.328.0
  org_url: https://github.com/itroom
runners:
  - id: php83
    name_prefix: my-runner-php83
    nb: 1
    build_image: ./config/Dockerfile.php83
    techno: php
    techno_version: "8.3"
  - id: node20
    name_prefix: my-runner-node20
    nb: 1
    build_image: ./config/Dockerfile.node20
    techno: node
    techno_version: "20"
    base_image: ghcr.io/itroom/node-runner:1.0.0
"#;

/// Tuesday
fn weekday_morning() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 6, 10)
        .unwrap()
        .and_hms_opt(9, 0, 0)
        .unwrap()
}

/// Saturday
fn weekend() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 6, 7)
        .unwrap()
        .and_hms_opt(10, 0, 0)
        .unwrap()
}

fn schedule(actions: &[Action], max_retries: u32) -> ScheduleConfig {
    ScheduleConfig {
        enabled: true,
        check_interval: Duration::from_secs(15),
        time_window: TimeWindow::parse("08:00-20:00").unwrap(),
        days: vec![
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
        ],
        actions: actions.iter().copied().collect::<BTreeSet<_>>(),
        max_retries,
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<YamlConfigStore>,
    registry: Arc<FakeRegistry>,
    builder: Arc<FakeBuilder>,
    runtime: Arc<FakeRuntime>,
    lifecycle: Arc<AgentLifecycleManager>,
    engine: Arc<ScheduleEngine>,
    rx: mpsc::UnboundedReceiver<NotificationEvent>,
}

async fn harness(yaml: &str, config: ScheduleConfig, registry: Arc<FakeRegistry>) -> Harness {
    harness_with(yaml, config, registry, ExternalTimeouts::default()).await
}

async fn harness_with(
    yaml: &str,
    config: ScheduleConfig,
    registry: Arc<FakeRegistry>,
    timeouts: ExternalTimeouts,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runners_config.yaml");
    tokio::fs::write(&path, yaml).await.unwrap();
    let store = Arc::new(YamlConfigStore::new(path));

    let (notifier, rx) = dispatcher::channel();
    let runtime = FakeRuntime::new();
    let builder = FakeBuilder::new();
    let lifecycle = lifecycle_with(runtime.clone(), notifier.clone());

    let engine = Arc::new(ScheduleEngine::new(
        config,
        EngineDeps {
            config_store: store.clone(),
            checker: ImageUpdateChecker::new(registry.clone(), Duration::from_secs(5)),
            builder: builder.clone(),
            lifecycle: lifecycle.clone(),
            notifier,
            timeouts,
        },
    ));

    Harness {
        _dir: dir,
        store,
        registry,
        builder,
        runtime,
        lifecycle,
        engine,
        rx,
    }
}

/// Lifecycle events published for one runner, in order
fn transitions_of(events: &[NotificationEvent], name: &str) -> Vec<EventKind> {
    events
        .iter()
        .filter(|e| e.get_str("runner_name") == Some(name))
        .map(|e| e.kind)
        .collect()
}

fn report_of(outcome: TickOutcome) -> runner_manager::scheduler::engine::CycleReport {
    match outcome {
        TickOutcome::Ran { report } => report,
        other => panic!("expected a cycle to run, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ticks_outside_schedule_are_gated() {
    let h = harness(
        CONFIG,
        schedule(&[Action::Check], 3),
        FakeRegistry::returning("2.328.0"),
    )
    .await;

    let outcome = h.engine.on_tick(weekend()).await;
    assert!(matches!(
        outcome,
        TickOutcome::Gated {
            decision: GateDecision::WrongDay { day: Weekday::Sat }
        }
    ));

    let evening = NaiveDate::from_ymd_opt(2025, 6, 10)
        .unwrap()
        .and_hms_opt(20, 1, 0)
        .unwrap();
    assert!(matches!(
        h.engine.on_tick(evening).await,
        TickOutcome::Gated {
            decision: GateDecision::OutsideWindow { .. }
        }
    ));

    let state = h.engine.snapshot().await;
    assert_eq!(state.status, EngineStatus::GatedWait);
    assert_eq!(state.cycles_run, 0);
    assert!(h.registry.lookups.lock().unwrap().is_empty());

    let report = report_of(h.engine.on_tick(weekday_morning()).await);
    assert!(report.succeeded());
    assert_eq!(h.engine.snapshot().await.cycles_run, 1);
}

#[tokio::test]
async fn test_consecutive_failures_halt_the_engine() {
    let mut h = harness(
        CONFIG,
        schedule(&[Action::Check, Action::Build], 2),
        FakeRegistry::failing("rate limited"),
    )
    .await;

    let report = report_of(h.engine.on_tick(weekday_morning()).await);
    assert!(!report.succeeded());
    assert!(report.outcomes[&Action::Check].is_failure());
    assert_eq!(
        report.outcomes[&Action::Build],
        ActionOutcome::skipped("no pending update")
    );

    let state = h.engine.snapshot().await;
    assert_eq!(state.consecutive_failures, 1);
    assert!(!state.halted);

    report_of(h.engine.on_tick(weekday_morning()).await);
    let state = h.engine.snapshot().await;
    assert_eq!(state.consecutive_failures, 2);
    assert!(state.halted);
    assert_eq!(state.status, EngineStatus::Halted);

    let events = drain(&mut h.rx);
    let fatal: Vec<_> = events
        .iter()
        .filter(|e| e.payload.get("fatal") == Some(&Value::Bool(true)))
        .collect();
    assert_eq!(fatal.len(), 1);
    assert_eq!(fatal[0].kind, EventKind::UpdateError);

    let lookups = h.registry.lookups.lock().unwrap().len();
    assert!(matches!(
        h.engine.on_tick(weekday_morning()).await,
        TickOutcome::Halted
    ));
    assert_eq!(h.registry.lookups.lock().unwrap().len(), lookups);
}

#[tokio::test]
async fn test_successful_cycle_resets_failure_counter() {
    let h = harness(
        CONFIG,
        schedule(&[Action::Check], 3),
        FakeRegistry::failing("connection reset"),
    )
    .await;

    h.engine.on_tick(weekday_morning()).await;
    h.engine.on_tick(weekday_morning()).await;
    assert_eq!(h.engine.snapshot().await.consecutive_failures, 2);

    h.registry.set_latest("2.328.0");
    let report = report_of(h.engine.on_tick(weekday_morning()).await);
    assert!(report.succeeded());

    let state = h.engine.snapshot().await;
    assert_eq!(state.consecutive_failures, 0);
    assert!(!state.halted);
    assert_eq!(state.status, EngineStatus::Idle);
    assert_eq!(state.last_outcomes[&Action::Check], ActionOutcome::Succeeded);
}

#[tokio::test]
async fn test_deploy_without_rebuild_is_skipped() {
    let h = harness(
        CONFIG,
        schedule(&[Action::Check, Action::Build, Action::Deploy], 3),
        FakeRegistry::returning("2.328.0"),
    )
    .await;

    let report = report_of(h.engine.on_tick(weekday_morning()).await);
    assert!(report.succeeded());
    assert!(report.updates.is_empty());
    assert!(matches!(
        report.outcomes[&Action::Deploy],
        ActionOutcome::Skipped { .. }
    ));
    assert!(h.builder.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_build_only_holds_back_its_own_image() {
    let h = harness(
        TWO_BASES,
        schedule(&[Action::Check, Action::Build], 3),
        FakeRegistry::returning("9.0.0"),
    )
    .await;
    h.builder.fail_dockerfile("./config/Dockerfile.php83");

    let report = report_of(h.engine.on_tick(weekday_morning()).await);
    assert!(!report.succeeded());
    assert!(report.outcomes[&Action::Build].is_failure());
    assert_eq!(report.updates.len(), 2);
    assert_eq!(report.rebuilt.len(), 1);
    assert_eq!(report.rebuilt[0].to, "ghcr.io/itroom/node-runner:9.0.0");

    let loaded = h.store.load().await.unwrap();
    let base_of = |id: &str| {
        loaded
            .definitions
            .iter()
            .find(|d| d.id == id)
            .unwrap()
            .base_image
            .clone()
    };
    assert_eq!(base_of("php83"), "ghcr.io/actions/actions-runner:2.328.0");
    assert_eq!(base_of("node20"), "ghcr.io/itroom/node-runner:9.0.0");
}

#[tokio::test]
async fn test_update_is_checked_built_persisted_and_deployed() {
    let mut h = harness(
        CONFIG,
        schedule(&[Action::Check, Action::Build, Action::Deploy], 3),
        FakeRegistry::returning("v2.329.0"),
    )
    .await;

    let definition = assert_ok!(h.store.load().await).definitions.remove(0);
    for slot in 1..=definition.nb {
        let instance = h.lifecycle.create_slot(&definition, slot).await.unwrap();
        h.lifecycle.start(&instance.id).await.unwrap();
    }
    assert_eq!(
        h.runtime.image_of("my-runner-php83-1").as_deref(),
        Some("itroom/php:8.3-2.328.0")
    );
    drain(&mut h.rx);

    let report = report_of(h.engine.on_tick(weekday_morning()).await);
    assert!(report.succeeded(), "{:?}", report.outcomes);
    assert_eq!(report.updates[0].latest, "2.329.0");
    assert_eq!(h.builder.built_tags(), vec!["itroom/php:8.3-2.329.0".to_string()]);
    assert_eq!(
        report.redeployed,
        vec![
            "my-runner-php83-1".to_string(),
            "my-runner-php83-2".to_string()
        ]
    );

    let loaded = assert_ok!(h.store.load().await);
    assert_eq!(
        loaded.definitions[0].base_image,
        "ghcr.io/actions/actions-runner:2.329.0"
    );

    for name in ["my-runner-php83-1", "my-runner-php83-2"] {
        assert_eq!(
            h.runtime.image_of(name).as_deref(),
            Some("itroom/php:8.3-2.329.0")
        );
        let instance = h.lifecycle.get(name).await.unwrap();
        assert_eq!(instance.base_image, "ghcr.io/actions/actions-runner:2.329.0");
        assert_eq!(instance.state(), RunnerState::Started);
    }

    let published = drain(&mut h.rx);
    for name in ["my-runner-php83-1", "my-runner-php83-2"] {
        assert_eq!(
            transitions_of(&published, name),
            vec![
                EventKind::RunnerStopped,
                EventKind::RunnerRemoved,
                EventKind::RunnerStarted
            ]
        );
    }

    let events = kinds(&published);
    let position = |kind: EventKind| events.iter().position(|k| *k == kind).unwrap();
    assert!(position(EventKind::UpdateAvailable) < position(EventKind::BuildStarted));
    assert!(position(EventKind::BuildCompleted) < position(EventKind::ImageUpdated));
    assert!(position(EventKind::ImageUpdated) < position(EventKind::RunnerStopped));
    assert!(events.contains(&EventKind::UpdateApplied));
}

#[tokio::test]
async fn test_group_without_dockerfile_pulls_new_base_before_deploy() {
    let mut h = harness(
        PLAIN_BASE,
        schedule(&[Action::Check, Action::Build, Action::Deploy], 3),
        FakeRegistry::returning("1.1"),
    )
    .await;

    let definition = assert_ok!(h.store.load().await).definitions.remove(0);
    assert!(definition.build_image.is_none());
    for slot in 1..=definition.nb {
        let instance = h.lifecycle.create_slot(&definition, slot).await.unwrap();
        h.lifecycle.start(&instance.id).await.unwrap();
    }
    drain(&mut h.rx);

    let report = report_of(h.engine.on_tick(weekday_morning()).await);
    assert!(report.succeeded(), "{:?}", report.outcomes);
    assert_eq!(*h.registry.lookups.lock().unwrap(), vec!["X".to_string()]);
    assert!(h.builder.requests.lock().unwrap().is_empty());
    assert_eq!(*h.builder.pulls.lock().unwrap(), vec!["X:1.1".to_string()]);

    let loaded = assert_ok!(h.store.load().await);
    assert_eq!(loaded.definitions[0].base_image, "X:1.1");

    for name in ["my-runner-php83-1", "my-runner-php83-2"] {
        assert_eq!(h.runtime.image_of(name).as_deref(), Some("X:1.1"));
        assert_eq!(
            h.lifecycle.get(name).await.unwrap().state(),
            RunnerState::Started
        );
    }

    let published = drain(&mut h.rx);
    for name in ["my-runner-php83-1", "my-runner-php83-2"] {
        assert_eq!(
            transitions_of(&published, name),
            vec![
                EventKind::RunnerStopped,
                EventKind::RunnerRemoved,
                EventKind::RunnerStarted
            ]
        );
    }

    let events = kinds(&published);
    let position = |kind: EventKind| events.iter().position(|k| *k == kind).unwrap();
    assert!(position(EventKind::UpdateAvailable) < position(EventKind::BuildStarted));
    assert!(position(EventKind::BuildStarted) < position(EventKind::BuildCompleted));
    assert!(position(EventKind::BuildCompleted) < position(EventKind::ImageUpdated));
    assert!(position(EventKind::ImageUpdated) < position(EventKind::RunnerStopped));
}

#[tokio::test]
async fn test_hung_build_times_out_and_counts_toward_halt() {
    let timeouts = ExternalTimeouts {
        build: Duration::from_millis(50),
        ..ExternalTimeouts::default()
    };
    let mut h = harness_with(
        CONFIG,
        schedule(&[Action::Check, Action::Build, Action::Deploy], 2),
        FakeRegistry::returning("2.329.0"),
        timeouts,
    )
    .await;
    h.builder.hang();

    let report = report_of(h.engine.on_tick(weekday_morning()).await);
    match &report.outcomes[&Action::Build] {
        ActionOutcome::Failed { reason } => assert!(reason.contains("timed out"), "{}", reason),
        other => panic!("expected the build to fail, got {:?}", other),
    }
    assert!(report.rebuilt.is_empty());
    assert_eq!(
        report.outcomes[&Action::Deploy],
        ActionOutcome::skipped("nothing rebuilt")
    );
    assert_eq!(h.engine.snapshot().await.consecutive_failures, 1);

    let loaded = assert_ok!(h.store.load().await);
    assert_eq!(
        loaded.definitions[0].base_image,
        "ghcr.io/actions/actions-runner:2.328.0"
    );

    report_of(h.engine.on_tick(weekday_morning()).await);
    let state = h.engine.snapshot().await;
    assert!(state.halted);
    assert_eq!(state.consecutive_failures, 2);

    let events = drain(&mut h.rx);
    assert_eq!(
        events
            .iter()
            .filter(|e| e.kind == EventKind::BuildFailed)
            .count(),
        2
    );
    assert!(events
        .iter()
        .any(|e| e.payload.get("fatal") == Some(&Value::Bool(true))));
}

struct FixedClock(NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

#[tokio::test]
async fn test_worker_returns_once_engine_halts() {
    let h = harness(
        CONFIG,
        schedule(&[Action::Check], 1),
        FakeRegistry::failing("registry down"),
    )
    .await;

    let options = scheduler::Options {
        interval: Duration::from_secs(15),
    };
    let worker = scheduler::run(
        &options,
        h.engine.clone(),
        Arc::new(FixedClock(weekday_morning())),
        |_| async {},
        Box::pin(std::future::pending::<()>()),
    );
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker should stop after halting");

    let state = h.engine.snapshot().await;
    assert!(state.halted);
    assert_eq!(state.cycles_run, 1);
}

#[tokio::test(start_paused = true)]
async fn test_worker_stops_on_shutdown() {
    let h = harness(
        CONFIG,
        schedule(&[Action::Check], 3),
        FakeRegistry::returning("2.328.0"),
    )
    .await;

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = tokio::spawn(async move {
        let options = scheduler::Options {
            interval: Duration::from_secs(15),
        };
        scheduler::run(
            &options,
            h.engine.clone(),
            Arc::new(FixedClock(weekend())),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = stop_rx.await;
            }),
        )
        .await;
        h.engine.snapshot().await
    });

    tokio::time::sleep(Duration::from_secs(50)).await;
    stop_tx.send(()).unwrap();
    let state = worker.await.unwrap();

    assert_eq!(state.cycles_run, 0);
    assert_eq!(state.status, EngineStatus::GatedWait);
}
