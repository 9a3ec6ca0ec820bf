//! Integration tests for the event bus: ordering, isolation, lifetimes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hearth_agent::bus::{
    handler_fn, topics, BusError, Event, EventBus, HandlerError, SubscriptionOptions,
};
use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(2);

fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &'static str) -> Arc<dyn hearth_agent::bus::EventHandler> {
    let log = log.clone();
    handler_fn(move |event: Arc<Event>| {
        let log = log.clone();
        async move {
            let n = event.payload.get("n").and_then(|v| v.as_u64()).unwrap_or(0);
            log.lock().push(format!("{}:{}", label, n));
            Ok(())
        }
    })
}

async fn flush(bus: &EventBus, topic: &str) {
    bus.publish_and_wait(Event::new(topic, json!({ "flush": true }))).await.unwrap();
}

#[tokio::test]
async fn test_publish_order_preserved_per_topic() {
    let bus = EventBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe(
        "counter",
        handler_fn(move |event: Arc<Event>| {
            let sink = sink.clone();
            async move {
                if let Some(n) = event.payload.get("n").and_then(|v| v.as_u64()) {
                    // Yield so a concurrent delivery would interleave.
                    tokio::task::yield_now().await;
                    sink.lock().push(n);
                }
                Ok(())
            }
        }),
    )
    .unwrap();

    for n in 0..200u64 {
        bus.publish("counter", json!({ "n": n }));
    }
    flush(&bus, "counter").await;

    let seen = seen.lock().clone();
    assert_eq!(seen, (0..200).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_priority_then_subscription_order() {
    let bus = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("job", recorder(&log, "low")).unwrap();
    bus.subscribe_with("job", SubscriptionOptions::priority(10), recorder(&log, "high"))
        .unwrap();
    bus.subscribe("job", recorder(&log, "low2")).unwrap();

    bus.publish_and_wait(Event::new("job", json!({ "n": 1 }))).await.unwrap();
    assert_eq!(*log.lock(), vec!["high:1", "low:1", "low2:1"]);
}

#[tokio::test]
async fn test_failing_and_panicking_handlers_are_isolated() {
    let bus = EventBus::new();
    let delivered = Arc::new(AtomicUsize::new(0));

    bus.subscribe(
        "work",
        handler_fn(|_| async { Err(HandlerError::failed("bad input")) }),
    )
    .unwrap();
    bus.subscribe(
        "work",
        handler_fn(|event: Arc<Event>| async move {
            if event.payload.is_object() {
                panic!("handler blew up");
            }
            Ok(())
        }),
    )
    .unwrap();
    let counter = delivered.clone();
    bus.subscribe(
        "work",
        handler_fn(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    )
    .unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    bus.subscribe(
        topics::HANDLER_ERROR,
        handler_fn(move |event: Arc<Event>| {
            let sink = sink.clone();
            async move {
                if let Some(error) = event.str_field("error") {
                    sink.lock().push(error.to_string());
                }
                Ok(())
            }
        }),
    )
    .unwrap();

    for _ in 0..3 {
        bus.publish("work", json!({}));
    }
    flush(&bus, "work").await;
    assert_eq!(delivered.load(Ordering::SeqCst), 4, "three events plus the flush");

    flush(&bus, topics::HANDLER_ERROR).await;
    let errors = errors.lock().clone();
    assert_eq!(errors.len(), 8);
    assert!(errors.iter().any(|e| e.contains("bad input")));
    assert!(errors.iter().any(|e| e.contains("handler blew up")));
}

#[tokio::test]
async fn test_glob_subscription_spans_topics() {
    let bus = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("model.*", recorder(&log, "model")).unwrap();

    bus.publish_and_wait(Event::new("model.ready", json!({ "n": 1 }))).await.unwrap();
    bus.publish_and_wait(Event::new("model.swapped", json!({ "n": 2 }))).await.unwrap();
    bus.publish_and_wait(Event::new("memory.pruned", json!({ "n": 3 }))).await.unwrap();

    assert_eq!(*log.lock(), vec!["model:1", "model:2"]);
    assert!(bus.topic_count() >= 3);
}

#[tokio::test]
async fn test_once_subscription_fires_once() {
    let bus = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe_with("tick", SubscriptionOptions::once(), recorder(&log, "once"))
        .unwrap();
    assert_eq!(bus.subscriber_count(), 1);

    for n in 0..3 {
        bus.publish("tick", json!({ "n": n }));
    }
    flush(&bus, "tick").await;

    assert_eq!(*log.lock(), vec!["once:0"]);
    assert_eq!(bus.subscriber_count(), 0);
}

#[tokio::test]
async fn test_unsubscribe_from_inside_handler() {
    let bus = EventBus::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let handle_slot = Arc::new(Mutex::new(None));

    let counter = calls.clone();
    let slot = handle_slot.clone();
    let bus_ref = bus.clone();
    let handle = bus
        .subscribe(
            "drip",
            handler_fn(move |_| {
                let counter = counter.clone();
                let slot = slot.clone();
                let bus = bus_ref.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if let Some(handle) = slot.lock().take() {
                        assert!(bus.unsubscribe(handle));
                    }
                    Ok(())
                }
            }),
        )
        .unwrap();
    *handle_slot.lock() = Some(handle);

    bus.publish("drip", json!({}));
    bus.publish("drip", json!({}));
    flush(&bus, "drip").await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!bus.unsubscribe(handle));
}

#[tokio::test]
async fn test_unsubscribed_peer_still_gets_in_flight_event() {
    let bus = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let peer = bus.subscribe("roster", recorder(&log, "peer")).unwrap();

    let sink = log.clone();
    let bus_ref = bus.clone();
    bus.subscribe_with(
        "roster",
        SubscriptionOptions::priority(10),
        handler_fn(move |event: Arc<Event>| {
            let sink = sink.clone();
            let bus = bus_ref.clone();
            async move {
                let n = event.payload["n"].as_u64().unwrap_or(0);
                sink.lock().push(format!("lead:{}", n));
                bus.unsubscribe(peer);
                Ok(())
            }
        }),
    )
    .unwrap();

    bus.publish_and_wait(Event::new("roster", json!({ "n": 1 }))).await.unwrap();
    bus.publish_and_wait(Event::new("roster", json!({ "n": 2 }))).await.unwrap();

    assert_eq!(*log.lock(), vec!["lead:1", "peer:1", "lead:2"]);
}

#[tokio::test]
async fn test_topics_deliver_independently() {
    let bus = EventBus::new();
    let gate = Arc::new(tokio::sync::Notify::new());
    let released = gate.clone();
    bus.subscribe(
        "slow",
        handler_fn(move |_| {
            let released = released.clone();
            async move {
                released.notified().await;
                Ok(())
            }
        }),
    )
    .unwrap();

    bus.publish("slow", json!({}));
    // A blocked topic must not hold up another one.
    let fast = tokio::time::timeout(WAIT, bus.publish_and_wait(Event::new("fast", json!({}))))
        .await;
    assert!(fast.is_ok());
    gate.notify_one();
}

#[tokio::test]
async fn test_wait_for_matches_correlation() {
    let bus = EventBus::new();
    let cid = Uuid::new_v4();
    let waiter = bus
        .waiter("reply.*", move |event: &Event| event.correlation_id == Some(cid))
        .unwrap();

    bus.publish_event(Event::new("reply.ok", json!({ "n": 1 })).with_correlation(Uuid::new_v4()));
    bus.publish_event(Event::new("reply.ok", json!({ "n": 2 })).with_correlation(cid));

    let event = waiter.wait(WAIT).await.unwrap();
    assert_eq!(event.payload["n"], 2);
    assert_eq!(event.correlation_id, Some(cid));

    let missed = bus
        .wait_for("reply.*", |_| false, Duration::from_millis(50))
        .await;
    assert!(matches!(missed, Err(BusError::Timeout(_))));
}

#[tokio::test]
async fn test_shutdown_drops_later_events() {
    let bus = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("after", recorder(&log, "after")).unwrap();

    bus.shutdown();
    assert!(bus.is_closed());
    bus.publish("after", json!({ "n": 1 }));
    assert!(matches!(
        bus.publish_and_wait(Event::new("after", json!({}))).await,
        Err(BusError::Closed)
    ));
    assert!(log.lock().is_empty());
    assert!(matches!(
        bus.subscribe("after", recorder(&log, "late")),
        Err(BusError::Closed)
    ));
}
