//! Operation status and record unit tests

use stackd::deploy::fsm::{transition, OperationStatus};
use stackd::models::operation::{
    OperationAction, OperationEventType, OperationPatch, StoreOperation, StoreOperationEvent,
};

fn step(progress: u8, step: &str) -> OperationPatch {
    OperationPatch {
        status: Some(OperationStatus::Running),
        progress_percent: Some(progress),
        current_step: Some(step.to_string()),
        ..Default::default()
    }
}

#[test]
fn test_fsm_initial_state() {
    let op = StoreOperation::queued("adguard-home", OperationAction::Install);
    assert_eq!(op.status, OperationStatus::Queued);
    assert_eq!(op.progress_percent, 0);
    assert!(op.started_at.is_none());
    assert!(op.finished_at.is_none());
    assert!(op.error_message.is_none());
}

#[test]
fn test_fsm_success_flow() {
    let mut op = StoreOperation::queued("adguard-home", OperationAction::Install);

    // Queued -> Running
    op.apply(&step(1, "Starting install")).unwrap();
    assert_eq!(op.status, OperationStatus::Running);
    let started_at = op.started_at;
    assert!(started_at.is_some());

    op.apply(&step(15, "Pulling images")).unwrap();
    op.apply(&step(85, "Starting containers")).unwrap();
    assert_eq!(op.started_at, started_at);

    // Running -> Success
    op.apply(&OperationPatch {
        status: Some(OperationStatus::Success),
        current_step: Some("Installed adguard-home".to_string()),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(op.status, OperationStatus::Success);
    assert_eq!(op.progress_percent, 100);
    assert!(op.finished_at.is_some());
}

#[test]
fn test_fsm_failure_flow() {
    let mut op = StoreOperation::queued("homepage", OperationAction::Install);
    op.apply(&step(15, "Pulling images")).unwrap();
    op.apply(&OperationPatch {
        status: Some(OperationStatus::Error),
        error_message: Some("pull failed".to_string()),
        ..Default::default()
    })
    .unwrap();

    assert_eq!(op.status, OperationStatus::Error);
    assert_eq!(op.progress_percent, 100);
    assert_eq!(op.error_message.as_deref(), Some("pull failed"));
}

#[test]
fn test_fsm_queued_can_fail_directly() {
    let mut op = StoreOperation::queued("homepage", OperationAction::Start);
    op.apply(&OperationPatch {
        status: Some(OperationStatus::Error),
        ..Default::default()
    })
    .unwrap();
    assert!(op.started_at.is_some());
    assert!(op.finished_at.is_some());
}

#[test]
fn test_fsm_progress_never_regresses() {
    let mut op = StoreOperation::queued("immich", OperationAction::Redeploy);
    op.apply(&step(60, "Pulling images")).unwrap();
    op.apply(&step(20, "Pulling images")).unwrap();
    assert_eq!(op.progress_percent, 60);

    // Non-terminal progress stays below 100
    op.apply(&step(100, "Starting containers")).unwrap();
    assert_eq!(op.progress_percent, 99);
}

#[test]
fn test_fsm_terminal_rejects_patches() {
    let mut op = StoreOperation::queued("immich", OperationAction::Stop);
    op.apply(&step(40, "Stopping containers")).unwrap();
    op.apply(&OperationPatch {
        status: Some(OperationStatus::Success),
        ..Default::default()
    })
    .unwrap();

    assert!(op.apply(&step(50, "late")).is_err());
    assert_eq!(op.status, OperationStatus::Success);
    assert!(transition(OperationStatus::Queued, OperationStatus::Success).is_err());
}

#[test]
fn test_event_serializes_wire_names() {
    let mut op = StoreOperation::queued("adguard-home", OperationAction::CheckUpdates);
    op.apply(&step(40, "Checking for image updates")).unwrap();

    let event = StoreOperationEvent::from_operation(OperationEventType::Step, &op);
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "operation.step");
    assert_eq!(json["action"], "check-updates");
    assert_eq!(json["status"], "running");
    assert_eq!(json["progressPercent"], 40);
    assert!(json.get("image").is_none());
}
