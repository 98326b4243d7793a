//! Shared fixtures for birthday service integration tests
//!
//! Everything runs against the in-memory broker and store; no external
//! services are needed.

#![allow(dead_code)]

use async_trait::async_trait;
use birthdays_rs::events::{
    birthday_topology, routing_key, ConsumerConfig, ConsumerError, ConsumerState, EventConsumer,
    EXCHANGE,
};
use birthdays_rs::models::Birthday;
use birthdays_rs::store::{BirthdayStore, InMemoryStore, StoreError};
use chrono::NaiveDate;
use event_bus::{Connector, EventBus, EventEnvelope, ExchangeSpec, InMemoryBroker, RetryConfig};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

/// Poll `check` until it holds or five seconds pass
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check().await
}

pub fn fast_consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        retry: RetryConfig::fixed(3, Duration::from_millis(10)),
        redelivery_delay: Duration::from_millis(10),
        handler_timeout: Some(Duration::from_secs(2)),
        consumer_tag: "test-consumer".to_string(),
    }
}

pub type ConsumerHandle = (
    JoinHandle<Result<(), ConsumerError>>,
    watch::Receiver<ConsumerState>,
);

/// Spawn a consumer and wait until it is consuming
pub async fn start_consumer(
    broker: &InMemoryBroker,
    store: Arc<dyn BirthdayStore>,
) -> ConsumerHandle {
    start_consumer_with(broker, store, fast_consumer_config()).await
}

pub async fn start_consumer_with(
    broker: &InMemoryBroker,
    store: Arc<dyn BirthdayStore>,
    config: ConsumerConfig,
) -> ConsumerHandle {
    let consumer = EventConsumer::new(Arc::new(broker.clone()), birthday_topology(), store, config);
    let mut state = consumer.state();
    let handle = consumer.spawn();

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConsumerState::Consuming),
    )
    .await
    .expect("consumer did not start in time")
    .expect("consumer state channel closed");

    (handle, state)
}

/// A producer-side channel, as the identity service would hold
pub async fn producer(broker: &InMemoryBroker) -> Arc<dyn EventBus> {
    let bus = broker.connect().await.expect("producer connect");
    bus.declare_exchange(&ExchangeSpec::topic(EXCHANGE))
        .await
        .expect("producer declare");
    bus
}

pub async fn send_user_event(bus: &dyn EventBus, event_type: &str, id: &str) {
    let body = EventEnvelope::new(event_type, serde_json::json!({ "id": id }))
        .with_service_origin("UserService")
        .with_environment("test")
        .to_bytes()
        .expect("encode envelope");
    bus.publish(EXCHANGE, &routing_key(event_type), body)
        .await
        .expect("publish user event");
}

pub async fn send_raw(bus: &dyn EventBus, routing_key: &str, body: impl Into<Vec<u8>>) {
    bus.publish(EXCHANGE, routing_key, body.into())
        .await
        .expect("publish raw message");
}

/// Wait until every message on the queue has been settled
pub async fn drained(broker: &InMemoryBroker, queue: &str) -> bool {
    let broker = broker.clone();
    let queue = queue.to_string();
    wait_until(move || {
        let broker = broker.clone();
        let queue = queue.clone();
        async move { broker.queue_depth(&queue).await == Some((0, 0)) }
    })
    .await
}

// ============================================================================
// Store doubles
// ============================================================================

/// In-memory store that fails a configurable number of calls
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryStore,
    failures_left: AtomicU32,
    failures_seen: AtomicU32,
    calls: AtomicU32,
}

impl FlakyStore {
    pub fn failing(times: u32) -> Self {
        let store = Self::default();
        store.failures_left.store(times, Ordering::SeqCst);
        store
    }

    pub fn failures_seen(&self) -> u32 {
        self.failures_seen.load(Ordering::SeqCst)
    }

    /// Store calls made, failed or not
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn trip(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let tripped = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if tripped {
            self.failures_seen.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl BirthdayStore for FlakyStore {
    async fn upsert_if_absent(
        &self,
        id: &str,
        birthday: Option<NaiveDate>,
    ) -> Result<bool, StoreError> {
        self.trip()?;
        self.inner.upsert_if_absent(id, birthday).await
    }

    async fn delete_if_present(&self, id: &str) -> Result<bool, StoreError> {
        self.trip()?;
        self.inner.delete_if_present(id).await
    }

    async fn get(&self, id: &str) -> Result<Option<Birthday>, StoreError> {
        self.trip()?;
        self.inner.get(id).await
    }

    async fn list_all(&self) -> Result<Vec<Birthday>, StoreError> {
        self.trip()?;
        self.inner.list_all().await
    }

    async fn update_birthday(
        &self,
        id: &str,
        birthday: Option<NaiveDate>,
    ) -> Result<Option<Birthday>, StoreError> {
        self.trip()?;
        self.inner.update_birthday(id, birthday).await
    }
}

/// In-memory store whose writes block until the test releases them
pub struct GatedStore {
    pub inner: InMemoryStore,
    gate: Semaphore,
    attempts: AtomicU32,
}

impl GatedStore {
    pub fn closed() -> Self {
        Self {
            inner: InMemoryStore::new(),
            gate: Semaphore::new(0),
            attempts: AtomicU32::new(0),
        }
    }

    /// Writes started, including ones abandoned while waiting at the gate
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn release(&self, writes: usize) {
        self.gate.add_permits(writes);
    }

    async fn pass(&self) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.gate
            .acquire()
            .await
            .map(|permit| permit.forget())
            .map_err(|_| StoreError::Database(sqlx::Error::PoolClosed))
    }
}

#[async_trait]
impl BirthdayStore for GatedStore {
    async fn upsert_if_absent(
        &self,
        id: &str,
        birthday: Option<NaiveDate>,
    ) -> Result<bool, StoreError> {
        self.pass().await?;
        self.inner.upsert_if_absent(id, birthday).await
    }

    async fn delete_if_present(&self, id: &str) -> Result<bool, StoreError> {
        self.pass().await?;
        self.inner.delete_if_present(id).await
    }

    async fn get(&self, id: &str) -> Result<Option<Birthday>, StoreError> {
        self.inner.get(id).await
    }

    async fn list_all(&self) -> Result<Vec<Birthday>, StoreError> {
        self.inner.list_all().await
    }

    async fn update_birthday(
        &self,
        id: &str,
        birthday: Option<NaiveDate>,
    ) -> Result<Option<Birthday>, StoreError> {
        self.pass().await?;
        self.inner.update_birthday(id, birthday).await
    }
}
