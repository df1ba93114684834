//! Event bus integration tests: persistence, fan-out, subscriber
//! isolation, and history ordering.

use std::sync::{Arc, Mutex};

use apiary_core::bus::{Event, EventBus, task_event, types};
use apiary_test_utils::create_test_db;

fn collector() -> (Arc<Mutex<Vec<String>>>, apiary_core::bus::EventCallback) {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: apiary_core::bus::EventCallback = Arc::new(move |event: &Event| {
        sink.lock().unwrap().push(event.event_type.clone());
        Ok(())
    });
    (seen, callback)
}

#[tokio::test]
async fn publish_persists_and_returns_id() {
    let db = create_test_db().await;
    let bus = EventBus::new(db.pool.clone());

    let event = Event::new(types::TASK_CREATED, "cli", serde_json::json!({"task_id": "t1"}));
    let published_at = event.timestamp;
    let event_id = bus.publish(event, None).await.unwrap();
    assert!(!event_id.is_empty());

    // Round-trip law: a published event is visible to a since-query.
    let found = bus
        .get_events(
            Some(types::TASK_CREATED),
            None,
            None,
            Some(published_at - chrono::Duration::seconds(1)),
            100,
        )
        .await
        .unwrap();
    assert!(found.iter().any(|e| e.event_id == event_id));
}

#[tokio::test]
async fn matching_subscribers_receive_events() {
    let db = create_test_db().await;
    let bus = EventBus::new(db.pool.clone());

    let (task_seen, task_cb) = collector();
    let (agent_seen, agent_cb) = collector();
    bus.subscribe("task.*", task_cb, "task-listener");
    bus.subscribe(types::AGENT_HEARTBEAT, agent_cb, "agent-listener");

    bus.publish(Event::new(types::TASK_STARTED, "queen", serde_json::json!({})), None)
        .await
        .unwrap();
    bus.publish(Event::new(types::AGENT_HEARTBEAT, "worker", serde_json::json!({})), None)
        .await
        .unwrap();
    bus.publish(
        Event::new(types::WORKFLOW_BLOCKED, "queen", serde_json::json!({})),
        None,
    )
    .await
    .unwrap();

    assert_eq!(*task_seen.lock().unwrap(), vec![types::TASK_STARTED.to_string()]);
    assert_eq!(*agent_seen.lock().unwrap(), vec![types::AGENT_HEARTBEAT.to_string()]);
}

#[tokio::test]
async fn failing_subscriber_is_isolated() {
    let db = create_test_db().await;
    let bus = EventBus::new(db.pool.clone());

    bus.subscribe(
        "*",
        Arc::new(|_: &Event| anyhow::bail!("subscriber exploded")),
        "broken-listener",
    );
    let (seen, cb) = collector();
    bus.subscribe("*", cb, "healthy-listener");

    // The publish itself must succeed and the healthy subscriber must
    // still be notified.
    let id = bus
        .publish(Event::new(types::TASK_FAILED, "queen", serde_json::json!({})), None)
        .await
        .unwrap();
    assert!(!id.is_empty());
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let db = create_test_db().await;
    let bus = EventBus::new(db.pool.clone());

    let (seen, cb) = collector();
    let sub_id = bus.subscribe("*", cb, "ephemeral");

    bus.publish(Event::new(types::TASK_QUEUED, "cli", serde_json::json!({})), None)
        .await
        .unwrap();
    assert!(bus.unsubscribe(&sub_id));
    assert!(!bus.unsubscribe(&sub_id));
    bus.publish(Event::new(types::TASK_QUEUED, "cli", serde_json::json!({})), None)
        .await
        .unwrap();

    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn correlation_threads_a_workflow_history() {
    let db = create_test_db().await;
    let bus = EventBus::new(db.pool.clone());

    let first = task_event(types::TASK_ASSIGNED, "t9", "queen", Some("assigned"), Some("backend"), Some("apply"));
    assert_eq!(first.correlation_id.as_deref(), Some("workflow_t9"));
    bus.publish(first, None).await.unwrap();

    let mut second = task_event(types::TASK_STARTED, "t9", "queen", Some("in_progress"), None, Some("apply"));
    second.timestamp += chrono::Duration::milliseconds(10);
    bus.publish(second, None).await.unwrap();

    let mut third = task_event(types::TASK_COMPLETED, "t9", "queen", Some("completed"), None, Some("test"));
    third.timestamp += chrono::Duration::milliseconds(20);
    bus.publish(third, None).await.unwrap();

    // History comes back in non-decreasing timestamp order.
    let history = bus.get_event_history("workflow_t9", 50).await.unwrap();
    assert_eq!(history.len(), 3);
    let event_types: Vec<&str> = history.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        event_types,
        vec![types::TASK_ASSIGNED, types::TASK_STARTED, types::TASK_COMPLETED]
    );
    for pair in history.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }

    // An explicit correlation override wins over the default.
    let overridden = task_event(types::TASK_ESCALATED, "t9", "queen", None, None, None);
    bus.publish(overridden, Some("custom-correlation")).await.unwrap();
    let custom = bus.get_event_history("custom-correlation", 50).await.unwrap();
    assert_eq!(custom.len(), 1);
}

#[tokio::test]
async fn get_events_returns_newest_first() {
    let db = create_test_db().await;
    let bus = EventBus::new(db.pool.clone());

    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        let mut event = Event::new(
            types::AGENT_HEARTBEAT,
            "worker",
            serde_json::json!({"seq": name}),
        );
        event.timestamp += chrono::Duration::milliseconds(i as i64 * 10);
        bus.publish(event, None).await.unwrap();
    }

    let events = bus
        .get_events(Some(types::AGENT_HEARTBEAT), None, None, None, 2)
        .await
        .unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].payload_str("seq"), Some("c"));
    assert_eq!(events[1].payload_str("seq"), Some("b"));
}

#[tokio::test]
async fn clear_old_events_respects_retention() {
    let db = create_test_db().await;
    let bus = EventBus::new(db.pool.clone());

    let mut old = Event::new(types::TASK_CREATED, "cli", serde_json::json!({}));
    old.timestamp -= chrono::Duration::days(60);
    bus.publish(old, None).await.unwrap();
    bus.publish(Event::new(types::TASK_CREATED, "cli", serde_json::json!({})), None)
        .await
        .unwrap();

    let deleted = bus.clear_old_events(30).await.unwrap();
    assert_eq!(deleted, 1);

    let remaining = bus
        .get_events(Some(types::TASK_CREATED), None, None, None, 100)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
}
