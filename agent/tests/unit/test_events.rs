//! Operation event bus tests

use std::sync::{Arc, Mutex};

use stackd::events::EventBus;
use stackd::models::operation::{
    OperationAction, OperationEventType, OperationPatch, OperationStatus, StoreOperation,
    StoreOperationEvent,
};

fn running(op: &mut StoreOperation, progress: u8, step: &str) -> StoreOperationEvent {
    op.apply(&OperationPatch {
        status: Some(OperationStatus::Running),
        progress_percent: Some(progress),
        current_step: Some(step.to_string()),
        ..Default::default()
    })
    .unwrap();
    StoreOperationEvent::from_operation(OperationEventType::Step, op)
}

fn completed(op: &mut StoreOperation) -> StoreOperationEvent {
    op.apply(&OperationPatch {
        status: Some(OperationStatus::Success),
        ..Default::default()
    })
    .unwrap();
    StoreOperationEvent::from_operation(OperationEventType::Completed, op)
}

#[test]
fn test_every_subscriber_receives_events() {
    let bus = EventBus::new(10);
    let mut op = StoreOperation::queued("adguard-home", OperationAction::Install);
    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));

    let sink = first.clone();
    let _a = bus.subscribe(&op.id, move |e| sink.lock().unwrap().push(e.progress_percent));
    let sink = second.clone();
    let _b = bus.subscribe(&op.id, move |e| sink.lock().unwrap().push(e.progress_percent));
    assert_eq!(bus.subscriber_count(&op.id), 2);

    bus.publish(running(&mut op, 8, "Rendering compose files"));
    bus.publish(running(&mut op, 15, "Pulling images"));

    assert_eq!(*first.lock().unwrap(), vec![8, 15]);
    assert_eq!(*second.lock().unwrap(), vec![8, 15]);
}

#[test]
fn test_explicit_unsubscribe() {
    let bus = EventBus::default();
    let mut op = StoreOperation::queued("homepage", OperationAction::Restart);
    let seen = Arc::new(Mutex::new(0));

    let sink = seen.clone();
    let subscription = bus.subscribe(&op.id, move |_| *sink.lock().unwrap() += 1);
    bus.publish(running(&mut op, 40, "Restarting containers"));
    subscription.unsubscribe();
    bus.publish(running(&mut op, 85, "Refreshing status"));

    assert_eq!(*seen.lock().unwrap(), 1);
    assert_eq!(bus.subscriber_count(&op.id), 0);
    // The cache is independent of subscribers
    assert_eq!(bus.get_latest(&op.id).unwrap().progress_percent, 85);
}

#[test]
fn test_handler_may_subscribe_while_publishing() {
    let bus = EventBus::new(10);
    let mut op = StoreOperation::queued("immich", OperationAction::Redeploy);
    let nested = Arc::new(Mutex::new(Vec::new()));

    let inner_bus = bus.clone();
    let keep = nested.clone();
    let _outer = bus.subscribe(&op.id, move |event| {
        let subscription = inner_bus.subscribe(&event.operation_id, |_| {});
        keep.lock().unwrap().push(subscription);
    });

    bus.publish(running(&mut op, 8, "Rendering compose files"));
    assert_eq!(nested.lock().unwrap().len(), 1);
    assert_eq!(bus.subscriber_count(&op.id), 2);
}

#[tokio::test]
async fn test_watch_after_completion_gets_terminal_snapshot() {
    let bus = EventBus::new(10);
    let mut op = StoreOperation::queued("homepage", OperationAction::Install);
    bus.publish(running(&mut op, 85, "Starting containers"));
    bus.publish(completed(&mut op));

    let mut watch = bus.watch(&op.id);
    let snapshot = watch.snapshot.clone().unwrap();
    assert_eq!(snapshot.event_type, OperationEventType::Completed);
    assert_eq!(snapshot.progress_percent, 100);
    assert!(watch.try_recv().is_none());
}

#[tokio::test]
async fn test_watch_streams_published_events_in_order() {
    let bus = EventBus::new(10);
    let mut op = StoreOperation::queued("adguard-home", OperationAction::Install);
    let mut watch = bus.watch(&op.id);
    assert!(watch.snapshot.is_none());

    let publisher = bus.clone();
    let events = vec![
        running(&mut op, 8, "Rendering compose files"),
        running(&mut op, 15, "Pulling images"),
        completed(&mut op),
    ];
    tokio::spawn(async move {
        for event in events {
            publisher.publish(event);
        }
    });

    let mut seen = Vec::new();
    while let Some(event) = watch.recv().await {
        let terminal = event.event_type.is_terminal();
        seen.push(event.progress_percent);
        if terminal {
            break;
        }
    }
    assert_eq!(seen, vec![8, 15, 100]);

    drop(watch);
    assert_eq!(bus.subscriber_count(&op.id), 0);
}
