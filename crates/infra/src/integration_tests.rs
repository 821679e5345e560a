//! End-to-end scenarios against the in-memory broker.
//!
//! Publish → stream → consumer loop → handlers → ack / dead-letter, plus
//! introspection, reconnect and pending-list recovery.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use agilebus_core::EventId;
use agilebus_events::{
    EventEnvelope, EventPriority, EventType, FailedRecord, NewEvent, RecordFields, encode_record,
    handler_fn,
};

use crate::broker::{InMemoryBroker, InMemoryConnector, ReadFrom, StreamBroker};
use crate::bus::EventBus;
use crate::config::BusConfig;
use crate::error::PublishError;
use crate::retry::RetryPolicy;

fn test_config() -> BusConfig {
    BusConfig {
        retry: RetryPolicy::exponential(3, Duration::from_millis(1), Duration::from_millis(4)),
        connect_retry: RetryPolicy::exponential(2, Duration::from_millis(1), Duration::from_millis(2)),
        block_timeout: Duration::from_millis(20),
        reconnect_delay: Duration::from_millis(5),
        error_backoff: Duration::from_millis(5),
        ..BusConfig::default()
    }
}

async fn connected_bus() -> (EventBus, Arc<InMemoryConnector>) {
    agilebus_observability::init();
    let connector = Arc::new(InMemoryConnector::new(InMemoryBroker::new()));
    let bus = EventBus::new(test_config(), connector.clone()).unwrap();
    bus.connect().await.unwrap();
    (bus, connector)
}

/// Poll `check` until it holds, failing the test after five seconds.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

fn recorder() -> (Arc<Mutex<Vec<EventEnvelope>>>, agilebus_events::SharedHandler) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = handler_fn("recorder", move |env| {
        sink.lock().unwrap().push(env.clone());
        Ok(())
    });
    (seen, handler)
}

#[tokio::test]
async fn heartbeat_shows_up_in_history() {
    let (bus, _) = connected_bus().await;

    let id = bus
        .publish(
            NewEvent::from_value(EventType::AgentHeartbeat, json!({"status": "active"}))
                .unwrap()
                .with_priority(EventPriority::Normal)
                .with_source("po-agent"),
        )
        .await
        .unwrap();
    assert!(id.to_string().parse::<EventId>().is_ok());

    let history = bus
        .get_event_history(Some(EventType::AgentHeartbeat), 1)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    let env = &history[0].envelope;
    assert_eq!(env.id(), id);
    assert_eq!(env.data()["status"], "active");
    assert_eq!(env.priority(), EventPriority::Normal);
    assert_eq!(env.source(), Some("po-agent"));
    assert_eq!(env.target(), None);
}

#[tokio::test]
async fn malformed_git_push_is_dead_lettered_after_three_attempts() {
    let (bus, connector) = connected_bus().await;
    let broker = connector.broker().clone();
    let config = bus.config().clone();

    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let consumer = bus.subscribe(
        &[EventType::GitPush],
        handler_fn("always-fails", move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("handler is broken"))
        }),
        None,
    );
    let handle = consumer.spawn();

    let mut raw = RecordFields::new();
    raw.insert("type".into(), "git.push".into());
    raw.insert("event".into(), "{\"id\": \"not-a-uuid\", \"data\": [".into());
    raw.insert("attempt".into(), "1".into());
    let message_id = broker.append(&config.stream, &raw).await.unwrap();

    eventually("dead-letter record", || broker.stream_len(&config.dlq_stream) == 1).await;
    eventually("ack after dead-lettering", || {
        broker.pending_count(&config.stream, &config.group) == 0
    })
    .await;
    let stats = handle.shutdown().await.unwrap();

    let failed = bus.get_failed_events(1).await.unwrap();
    assert_eq!(failed.len(), 1);
    let FailedRecord::Message(message) = &failed[0].record else {
        panic!("expected a failed message, got {:?}", failed[0].record);
    };
    assert_eq!(message.retry_count, 3);
    assert_eq!(message.message_id, message_id);
    assert_eq!(message.fields, raw);
    assert!(message.error.contains("invalid envelope json"));

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.processed, 1);

    // The original record stays in the main stream for audit.
    assert_eq!(broker.stream_len(&config.stream), 1);
}

#[tokio::test]
async fn repeated_connect_keeps_group_count() {
    let (bus, _) = connected_bus().await;
    let before = bus.get_stream_info().await.unwrap();

    bus.connect().await.unwrap();
    let after = bus.get_stream_info().await.unwrap();

    assert_eq!(before.groups, after.groups);
    assert_eq!(after.groups, 1);
    assert_eq!(after.stream_name, bus.config().stream);
}

#[tokio::test]
async fn failing_handler_does_not_block_its_neighbour() {
    let (bus, connector) = connected_bus().await;
    let broker = connector.broker().clone();
    let config = bus.config().clone();

    let (seen, recorder) = recorder();
    let mut consumer = bus.consumer(Some("isolation".into()));
    consumer.subscribe(
        &[EventType::WorkflowCompleted],
        handler_fn("broken", |_| Err(anyhow::anyhow!("boom"))),
    );
    consumer.subscribe(&[EventType::WorkflowCompleted], recorder);
    let handle = consumer.spawn();

    let id = bus
        .publish(NewEvent::from_value(EventType::WorkflowCompleted, json!({"run": 7})).unwrap())
        .await
        .unwrap();

    eventually("second handler runs", || seen.lock().unwrap().len() == 1).await;
    eventually("record acknowledged", || {
        broker.pending_count(&config.stream, &config.group) == 0
    })
    .await;
    let stats = handle.shutdown().await.unwrap();

    assert_eq!(seen.lock().unwrap()[0].id(), id);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.handler_failures, 1);
    assert_eq!(stats.handlers_invoked, 2);
    assert!(bus.get_failed_events(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn flaky_handler_never_dead_letters() {
    let (bus, connector) = connected_bus().await;
    let broker = connector.broker().clone();
    let config = bus.config().clone();

    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let consumer = bus.subscribe(
        &[EventType::AgentCompleted],
        handler_fn("flaky", move |_| {
            if counted.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow::anyhow!("transient"))
            } else {
                Ok(())
            }
        }),
        Some("flaky-consumer".into()),
    );
    let handle = consumer.spawn();

    for n in 0..3 {
        bus.publish(NewEvent::from_value(EventType::AgentCompleted, json!({"n": n})).unwrap())
            .await
            .unwrap();
    }

    eventually("three deliveries", || calls.load(Ordering::SeqCst) == 3).await;
    eventually("all acknowledged", || {
        broker.pending_count(&config.stream, &config.group) == 0
    })
    .await;
    let stats = handle.shutdown().await.unwrap();

    assert_eq!(stats.acked, 3);
    assert_eq!(stats.handler_failures, 2);
    assert_eq!(stats.dead_lettered, 0);
    assert_eq!(broker.stream_len(&config.dlq_stream), 0);
}

#[tokio::test]
async fn publish_exhaustion_archives_the_event() {
    let (bus, connector) = connected_bus().await;
    connector.broker().fail_next_appends(3);

    let err = bus
        .publish(NewEvent::from_value(EventType::WellnessAlert, json!({"member": "dev-2"})).unwrap())
        .await
        .unwrap_err();
    let PublishError::Exhausted { event_id, attempts, .. } = err else {
        panic!("expected exhaustion, got {err:?}");
    };
    assert_eq!(attempts, 3);

    assert!(bus.get_event_history(None, 10).await.unwrap().is_empty());
    let failed = bus.get_failed_events(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    let FailedRecord::Event(event) = &failed[0].record else {
        panic!("expected a failed event");
    };
    assert_eq!(event.envelope.id(), event_id);
    assert_eq!(event.retry_count, 3);
    assert_eq!(event.envelope.data()["member"], "dev-2");
}

#[tokio::test]
async fn consumer_recovers_after_broker_outage() {
    let (bus, connector) = connected_bus().await;
    let broker = connector.broker().clone();

    let (seen, recorder) = recorder();
    let handle = bus
        .subscribe(&[EventType::SystemHealth], recorder, Some("survivor".into()))
        .spawn();

    bus.publish(NewEvent::from_value(EventType::SystemHealth, json!({"phase": 1})).unwrap())
        .await
        .unwrap();
    eventually("first delivery", || seen.lock().unwrap().len() == 1).await;

    let connects_before = connector.connect_count();
    broker.set_offline(true);
    tokio::time::sleep(Duration::from_millis(60)).await;
    broker.set_offline(false);

    eventually("reconnected", || connector.connect_count() > connects_before).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !bus.is_connected().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    bus.publish(NewEvent::from_value(EventType::SystemHealth, json!({"phase": 2})).unwrap())
        .await
        .unwrap();
    eventually("delivery after outage", || seen.lock().unwrap().len() == 2).await;

    let stats = handle.shutdown().await.unwrap();
    assert_eq!(stats.acked, 2);
}

#[tokio::test]
async fn restarted_consumer_drains_its_pending_list_first() {
    let (bus, connector) = connected_bus().await;
    let broker = connector.broker().clone();
    let config = bus.config().clone();

    let mut ids = Vec::new();
    for n in 0..2 {
        let env = EventEnvelope::new(
            NewEvent::from_value(EventType::GitIssueCreated, json!({"n": n})).unwrap(),
        );
        ids.push(env.id());
        broker.append(&config.stream, &encode_record(&env, 1).unwrap()).await.unwrap();
    }

    // A previous incarnation of "worker-a" claimed both records and died.
    let mut reader = broker.reader().await.unwrap();
    let claimed = reader
        .read(&config.stream, &config.group, "worker-a", ReadFrom::New, 10, config.block_timeout)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 2);
    assert_eq!(broker.pending_count(&config.stream, &config.group), 2);

    let (seen, recorder) = recorder();
    let handle = bus
        .subscribe(&[EventType::GitIssueCreated], recorder, Some("worker-a".into()))
        .spawn();

    eventually("pending records redelivered", || seen.lock().unwrap().len() == 2).await;
    eventually("pending list empty", || {
        broker.pending_count(&config.stream, &config.group) == 0
    })
    .await;
    handle.shutdown().await.unwrap();

    let delivered: Vec<EventId> = seen.lock().unwrap().iter().map(|e| e.id()).collect();
    assert_eq!(delivered, ids);
}

#[tokio::test]
async fn consumers_in_one_group_split_the_stream() {
    let (bus, _) = connected_bus().await;

    let (seen_a, recorder_a) = recorder();
    let (seen_b, recorder_b) = recorder();
    let a = bus.subscribe(&[EventType::GitPrCreated], recorder_a, Some("a".into())).spawn();
    let b = bus.subscribe(&[EventType::GitPrCreated], recorder_b, Some("b".into())).spawn();

    for n in 0..20 {
        bus.publish(NewEvent::from_value(EventType::GitPrCreated, json!({"pr": n})).unwrap())
            .await
            .unwrap();
    }

    let total = || seen_a.lock().unwrap().len() + seen_b.lock().unwrap().len();
    eventually("all records delivered", || total() == 20).await;
    let stats_a = a.shutdown().await.unwrap();
    let stats_b = b.shutdown().await.unwrap();

    let mut ids: HashSet<EventId> = HashSet::new();
    for env in seen_a.lock().unwrap().iter().chain(seen_b.lock().unwrap().iter()) {
        assert!(ids.insert(env.id()), "record delivered twice");
    }
    assert_eq!(stats_a.acked + stats_b.acked, 20);
    assert_eq!(bus.get_stream_info().await.unwrap().consumers, 2);
}

#[tokio::test]
async fn published_ids_are_unique() {
    let (bus, _) = connected_bus().await;

    let mut ids = HashSet::new();
    for _ in 0..200 {
        let id = bus
            .publish(NewEvent::from_value(EventType::AgentHeartbeat, json!({})).unwrap())
            .await
            .unwrap();
        assert!(ids.insert(id));
    }
    assert_eq!(bus.get_stream_info().await.unwrap().length, 200);
}

#[tokio::test]
async fn disabled_bus_refuses_to_connect() {
    let connector = Arc::new(InMemoryConnector::new(InMemoryBroker::new()));
    let bus = EventBus::new(BusConfig { enabled: false, ..test_config() }, connector.clone())
        .unwrap();

    assert!(matches!(
        bus.connect().await,
        Err(crate::error::ConnectError::Disabled)
    ));
    assert!(matches!(
        bus.publish(NewEvent::from_value(EventType::AgentError, json!({})).unwrap()).await,
        Err(PublishError::Connect(_))
    ));
    assert_eq!(connector.connect_count(), 0);
}

#[tokio::test]
async fn publish_succeeds_while_a_consumer_is_reconnecting() {
    agilebus_observability::init();
    let connector = Arc::new(InMemoryConnector::new(InMemoryBroker::new()));
    let broker = connector.broker().clone();
    let bus = EventBus::new(
        BusConfig {
            reconnect_delay: Duration::from_millis(300),
            ..test_config()
        },
        connector.clone(),
    )
    .unwrap();
    bus.connect().await.unwrap();
    let config = bus.config().clone();

    let (seen, recorder) = recorder();
    let handle = bus
        .subscribe(&[EventType::GitRelease], recorder, Some("releases".into()))
        .spawn();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let connects_before = connector.connect_count();
    broker.set_offline(true);
    tokio::time::sleep(Duration::from_millis(30)).await;
    broker.set_offline(false);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The consumer is still inside its reconnect delay here.
    let id = bus
        .publish(NewEvent::from_value(EventType::GitRelease, json!({"tag": "v2"})).unwrap())
        .await
        .unwrap();
    assert_eq!(broker.stream_len(&config.dlq_stream), 0);

    eventually("consumer reconnected", || connector.connect_count() > connects_before).await;
    eventually("release delivered", || seen.lock().unwrap().len() == 1).await;
    handle.shutdown().await.unwrap();
    assert_eq!(seen.lock().unwrap()[0].id(), id);
}

#[tokio::test]
async fn failed_ack_is_redelivered_from_the_pending_list() {
    let (bus, connector) = connected_bus().await;
    let broker = connector.broker().clone();
    let config = bus.config().clone();

    let (seen, recorder) = recorder();
    let handle = bus
        .subscribe(&[EventType::WorkflowStarted], recorder, Some("acker".into()))
        .spawn();

    broker.fail_next_acks(1);
    let id = bus
        .publish(NewEvent::from_value(EventType::WorkflowStarted, json!({"run": 1})).unwrap())
        .await
        .unwrap();

    eventually("delivered again after reconnect", || seen.lock().unwrap().len() == 2).await;
    eventually("acknowledged", || {
        broker.pending_count(&config.stream, &config.group) == 0
    })
    .await;
    let stats = handle.shutdown().await.unwrap();

    let delivered: Vec<EventId> = seen.lock().unwrap().iter().map(|e| e.id()).collect();
    assert_eq!(delivered, vec![id, id]);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.dead_lettered, 0);
    assert!(bus.get_failed_events(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn dead_letter_outage_does_not_advance_the_attempt_count() {
    let (bus, connector) = connected_bus().await;
    let broker = connector.broker().clone();
    let config = bus.config().clone();

    let mut raw = RecordFields::new();
    raw.insert("type".into(), "workflow.failed".into());
    raw.insert("event".into(), "not json".into());
    let message_id = broker.append(&config.stream, &raw).await.unwrap();

    broker.fail_next_appends(1);
    let handle = bus.consumer(Some("archiver".into())).spawn();

    eventually("dead-letter record", || broker.stream_len(&config.dlq_stream) == 1).await;
    eventually("acknowledged", || {
        broker.pending_count(&config.stream, &config.group) == 0
    })
    .await;
    let stats = handle.shutdown().await.unwrap();

    let failed = bus.get_failed_events(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    let FailedRecord::Message(message) = &failed[0].record else {
        panic!("expected a failed message, got {:?}", failed[0].record);
    };
    assert_eq!(message.message_id, message_id);
    assert_eq!(message.retry_count, 3);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.acked, 1);
}

#[test]
fn bus_rejects_an_unbounded_block_timeout() {
    let connector = Arc::new(InMemoryConnector::new(InMemoryBroker::new()));
    let config = BusConfig {
        block_timeout: Duration::ZERO,
        ..test_config()
    };
    assert!(matches!(
        EventBus::new(config, connector),
        Err(crate::error::ConfigError::Invalid(_))
    ));
}
