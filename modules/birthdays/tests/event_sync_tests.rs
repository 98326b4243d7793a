//! Event synchronization: broker -> consumer -> store
//!
//! Each test drives a real consumer task over the in-memory broker and checks
//! the store and queue after the messages have been settled.

mod common;

use birthdays_rs::events::{
    birthday_topology, routing_key, ConsumerConfig, ConsumerError, ConsumerState, EnvelopeOrigin,
    EventConsumer, EventPublisher, EXCHANGE, QUEUE, USER_CREATED, USER_DELETED,
};
use birthdays_rs::models::UserRef;
use birthdays_rs::store::{BirthdayStore, InMemoryStore};
use chrono::NaiveDate;
use common::{
    drained, fast_consumer_config, producer, send_raw, send_user_event, start_consumer,
    start_consumer_with, wait_until, FlakyStore, GatedStore,
};
use event_bus::{BusError, Connector, EventEnvelope, ExchangeKind, ExchangeSpec, InMemoryBroker};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_repeated_user_created_yields_one_record() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryStore::new());
    let (_consumer, _state) = start_consumer(&broker, store.clone()).await;
    let bus = producer(&broker).await;

    for _ in 0..3 {
        send_user_event(bus.as_ref(), USER_CREATED, "u1").await;
    }

    assert!(drained(&broker, QUEUE).await);
    assert_eq!(store.len().await, 1);
    assert_eq!(store.get("u1").await.unwrap().unwrap().birthday, None);
}

#[tokio::test]
async fn test_user_created_keeps_existing_birthday() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryStore::new());
    let date = NaiveDate::from_ymd_opt(1985, 12, 24);
    store.upsert_if_absent("u1", date).await.unwrap();

    let (_consumer, _state) = start_consumer(&broker, store.clone()).await;
    let bus = producer(&broker).await;
    send_user_event(bus.as_ref(), USER_CREATED, "u1").await;

    assert!(drained(&broker, QUEUE).await);
    assert_eq!(store.get("u1").await.unwrap().unwrap().birthday, date);
}

#[tokio::test]
async fn test_repeated_user_deleted_is_harmless() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryStore::new());
    store.upsert_if_absent("u1", None).await.unwrap();

    let (_consumer, _state) = start_consumer(&broker, store.clone()).await;
    let bus = producer(&broker).await;
    send_user_event(bus.as_ref(), USER_DELETED, "u1").await;
    send_user_event(bus.as_ref(), USER_DELETED, "u1").await;

    assert!(drained(&broker, QUEUE).await);
    assert!(store.get("u1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_for_unknown_user_then_create() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryStore::new());
    let (_consumer, _state) = start_consumer(&broker, store.clone()).await;
    let bus = producer(&broker).await;

    send_user_event(bus.as_ref(), USER_DELETED, "u7").await;
    send_user_event(bus.as_ref(), USER_CREATED, "u7").await;

    assert!(drained(&broker, QUEUE).await);
    assert!(store.get("u7").await.unwrap().is_some());
}

#[tokio::test]
async fn test_malformed_message_does_not_block_queue() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryStore::new());
    let (_consumer, _state) = start_consumer(&broker, store.clone()).await;
    let bus = producer(&broker).await;

    send_raw(bus.as_ref(), &routing_key(USER_CREATED), "{not json").await;
    send_raw(
        bus.as_ref(),
        &routing_key(USER_CREATED),
        r#"{"eventType":"userCreated","payload":{"id":"u0"}}"#,
    )
    .await;
    let missing_id = EventEnvelope::new(USER_CREATED, serde_json::json!({"name": "nobody"}))
        .to_bytes()
        .unwrap();
    send_raw(bus.as_ref(), &routing_key(USER_CREATED), missing_id).await;
    send_user_event(bus.as_ref(), USER_CREATED, "u2").await;

    assert!(drained(&broker, QUEUE).await);
    let ids: Vec<String> = store
        .list_all()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec!["u2".to_string()]);
}

#[tokio::test]
async fn test_unknown_event_type_is_acked_without_store_call() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(FlakyStore::default());
    let (_consumer, _state) = start_consumer(&broker, store.clone()).await;
    let bus = producer(&broker).await;

    // Routed by a bound key but carrying a type this service does not know
    let body = EventEnvelope::new("somethingElse", serde_json::json!({"id": "u1"}))
        .to_bytes()
        .unwrap();
    send_raw(bus.as_ref(), &routing_key(USER_CREATED), body).await;
    send_user_event(bus.as_ref(), USER_CREATED, "u2").await;

    assert!(drained(&broker, QUEUE).await);
    assert!(store.inner.get("u1").await.unwrap().is_none());
    assert!(store.inner.get("u2").await.unwrap().is_some());
    // Only u2's upsert reached the store
    assert_eq!(store.calls(), 1);
}

#[tokio::test]
async fn test_store_failure_is_redelivered_until_applied() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(FlakyStore::failing(1));
    let (_consumer, _state) = start_consumer(&broker, store.clone()).await;
    let bus = producer(&broker).await;

    send_user_event(bus.as_ref(), USER_CREATED, "u3").await;

    let watched = store.clone();
    assert!(
        wait_until(move || {
            let watched = watched.clone();
            async move { watched.inner.get("u3").await.unwrap().is_some() }
        })
        .await
    );
    assert!(drained(&broker, QUEUE).await);
    assert_eq!(store.failures_seen(), 1);
}

#[tokio::test]
async fn test_handler_timeout_requeues_until_store_responds() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(GatedStore::closed());
    let config = ConsumerConfig {
        handler_timeout: Some(Duration::from_millis(50)),
        ..fast_consumer_config()
    };
    let (_consumer, _state) = start_consumer_with(&broker, store.clone(), config).await;
    let bus = producer(&broker).await;

    send_user_event(bus.as_ref(), USER_CREATED, "u6").await;

    // A second write attempt means the first timed out and was requeued
    let watched = store.clone();
    assert!(
        wait_until(move || {
            let watched = watched.clone();
            async move { watched.attempts() >= 2 }
        })
        .await
    );
    assert!(store.inner.get("u6").await.unwrap().is_none());
    let (ready, unacked) = broker.queue_depth(QUEUE).await.unwrap();
    assert_eq!(ready + unacked, 1);

    store.release(1);

    assert!(drained(&broker, QUEUE).await);
    assert!(store.inner.get("u6").await.unwrap().is_some());
}

#[tokio::test]
async fn test_published_user_events_flow_through_consumer() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryStore::new());
    let (_consumer, _state) = start_consumer(&broker, store.clone()).await;
    let publisher = EventPublisher::new(
        Arc::new(broker.clone()),
        EnvelopeOrigin {
            service_origin: "UserService".to_string(),
            ..EnvelopeOrigin::default()
        },
        Duration::from_secs(1),
    );

    publisher
        .try_publish(USER_CREATED, &UserRef { id: "u1".into() })
        .await
        .unwrap();
    assert!(drained(&broker, QUEUE).await);
    assert_eq!(store.get("u1").await.unwrap().unwrap().birthday, None);

    publisher
        .try_publish(USER_DELETED, &UserRef { id: "u1".into() })
        .await
        .unwrap();
    assert!(drained(&broker, QUEUE).await);
    assert!(store.get("u1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_consumer_resumes_after_broker_disconnect() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryStore::new());
    let (_consumer, mut state) = start_consumer(&broker, store.clone()).await;

    broker.disconnect_all().await;

    let watched = broker.clone();
    assert!(
        wait_until(move || {
            let watched = watched.clone();
            async move { watched.connection_attempts().await >= 2 }
        })
        .await
    );
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConsumerState::Consuming),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(broker.binding_count(QUEUE).await, 2);

    let bus = producer(&broker).await;
    send_user_event(bus.as_ref(), USER_CREATED, "u4").await;

    assert!(drained(&broker, QUEUE).await);
    assert!(store.get("u4").await.unwrap().is_some());
}

#[tokio::test]
async fn test_in_flight_message_is_redelivered_after_disconnect() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(GatedStore::closed());
    let (_consumer, _state) = start_consumer(&broker, store.clone()).await;
    let bus = producer(&broker).await;

    send_user_event(bus.as_ref(), USER_CREATED, "u5").await;

    let watched = broker.clone();
    assert!(
        wait_until(move || {
            let watched = watched.clone();
            async move { watched.queue_depth(QUEUE).await == Some((0, 1)) }
        })
        .await
    );

    // Handler is blocked; the broker drops the channel under it
    broker.disconnect_all().await;
    assert_eq!(broker.queue_depth(QUEUE).await, Some((1, 0)));

    store.release(2);

    assert!(drained(&broker, QUEUE).await);
    assert!(store.inner.get("u5").await.unwrap().is_some());
    assert!(broker.connection_attempts().await >= 3);
}

#[tokio::test]
async fn test_consumer_gives_up_when_broker_stays_down() {
    let broker = InMemoryBroker::new();
    broker.refuse_connections(100).await;

    let consumer = EventConsumer::new(
        Arc::new(broker.clone()),
        birthday_topology(),
        Arc::new(InMemoryStore::new()),
        fast_consumer_config(),
    );

    let result = tokio::time::timeout(Duration::from_secs(5), consumer.spawn())
        .await
        .unwrap()
        .unwrap();

    match result {
        Err(ConsumerError::Connect(BusError::RetriesExhausted { attempts, .. })) => {
            assert_eq!(attempts, 3)
        }
        other => panic!("unexpected consumer result: {other:?}"),
    }
}

#[tokio::test]
async fn test_conflicting_exchange_declaration_is_fatal() {
    let broker = InMemoryBroker::new();
    let other = broker.connect().await.unwrap();
    other
        .declare_exchange(&ExchangeSpec {
            name: EXCHANGE.to_string(),
            kind: ExchangeKind::Fanout,
            durable: true,
        })
        .await
        .unwrap();

    let consumer = EventConsumer::new(
        Arc::new(broker.clone()),
        birthday_topology(),
        Arc::new(InMemoryStore::new()),
        fast_consumer_config(),
    );

    let err = consumer.run().await.unwrap_err();
    assert!(matches!(
        err,
        ConsumerError::Topology(BusError::PreconditionFailed(_))
    ));
}
