//! Runner FSM tests

use runner_manager::lifecycle::fsm::{is_valid_path, RunnerEvent, RunnerFsm, RunnerState};

#[test]
fn test_fsm_initial_state() {
    let fsm = RunnerFsm::new();
    assert_eq!(fsm.state(), RunnerState::Created);
    assert!(fsm.error().is_none());
    assert_eq!(fsm.history(), &[RunnerState::Created]);
}

#[test]
fn test_fsm_full_lifecycle() {
    let mut fsm = RunnerFsm::new();

    fsm.process(RunnerEvent::Start).unwrap();
    fsm.process(RunnerEvent::Run).unwrap();
    fsm.process(RunnerEvent::Stop).unwrap();
    fsm.process(RunnerEvent::Start).unwrap();
    fsm.process(RunnerEvent::Stop).unwrap();
    fsm.process(RunnerEvent::Remove).unwrap();

    assert_eq!(fsm.state(), RunnerState::Removed);
    assert!(fsm.state().is_terminal());
    assert!(is_valid_path(fsm.history()));
    assert_eq!(fsm.history().len(), 7);
}

#[test]
fn test_fsm_failure_and_recovery() {
    let mut fsm = RunnerFsm::new();

    fsm.process(RunnerEvent::Start).unwrap();
    fsm.process(RunnerEvent::Fail("container exited".to_string()))
        .unwrap();
    assert_eq!(fsm.state(), RunnerState::Error);
    assert_eq!(fsm.error(), Some("container exited"));

    // A repeated failure refreshes the cause
    fsm.process(RunnerEvent::Fail("still down".to_string()))
        .unwrap();
    assert_eq!(fsm.error(), Some("still down"));

    fsm.process(RunnerEvent::Start).unwrap();
    assert_eq!(fsm.state(), RunnerState::Started);
    assert!(fsm.error().is_none());
    assert!(is_valid_path(fsm.history()));
}

#[test]
fn test_fsm_rejects_invalid_transitions() {
    let mut fsm = RunnerFsm::new();

    let err = fsm.process(RunnerEvent::Stop).unwrap_err();
    assert_eq!(err.from, RunnerState::Created);
    assert_eq!(err.to, RunnerState::Stopped);

    assert!(fsm.process(RunnerEvent::Run).is_err());
    assert!(fsm.process(RunnerEvent::Remove).is_err());

    // Rejected events leave no trace
    assert_eq!(fsm.state(), RunnerState::Created);
    assert_eq!(fsm.history(), &[RunnerState::Created]);

    fsm.process(RunnerEvent::Start).unwrap();
    fsm.process(RunnerEvent::Run).unwrap();
    assert!(fsm.process(RunnerEvent::Remove).is_err());
    assert!(fsm.process(RunnerEvent::Start).is_err());
}

#[test]
fn test_fsm_removed_is_terminal() {
    let mut fsm = RunnerFsm::new();
    fsm.process(RunnerEvent::Fail("no token".to_string())).unwrap();
    fsm.process(RunnerEvent::Remove).unwrap();

    for event in [
        RunnerEvent::Start,
        RunnerEvent::Run,
        RunnerEvent::Stop,
        RunnerEvent::Remove,
        RunnerEvent::Fail("late".to_string()),
    ] {
        assert!(fsm.check(&event).is_err(), "{:?} accepted from removed", event);
    }
}

#[test]
fn test_is_valid_path() {
    use RunnerState::*;

    assert!(is_valid_path(&[Created, Started, Running, Stopped, Removed]));
    assert!(is_valid_path(&[Created, Error, Started, Error, Removed]));
    assert!(!is_valid_path(&[Started, Running]));
    assert!(!is_valid_path(&[Created, Running]));
    assert!(!is_valid_path(&[Created, Started, Created]));
    assert!(!is_valid_path(&[]));
}
