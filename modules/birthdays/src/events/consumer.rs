//! Long-running consumer of identity-service lifecycle events
//!
//! One task owns one broker channel and processes deliveries strictly in
//! order. A delivery is acknowledged only once its handler succeeded (or the
//! message can never succeed and is dropped); application failures are
//! negatively acknowledged with requeue so the broker redelivers them.
//!
//! ```text
//! Connecting -> Bound -> Consuming --(transport error)--> Reconnecting -> Connecting
//! ```

use super::handlers::{dispatch, Applied};
use super::user_events::{EventDecodeError, UserEvent};
use crate::store::{BirthdayStore, StoreError};
use event_bus::{
    connect_with_retry, BusError, BusResult, Connector, Delivery, EventBus, EventEnvelope,
    RetryConfig, Topology,
};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Bounded retry for each (re)connection
    pub retry: RetryConfig,
    /// Pause before a failed delivery is handed back to the broker
    pub redelivery_delay: Duration,
    /// Upper bound on a single handler call; `None` waits indefinitely
    pub handler_timeout: Option<Duration>,
    pub consumer_tag: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            redelivery_delay: Duration::from_secs(1),
            handler_timeout: Some(Duration::from_secs(10)),
            consumer_tag: "birthdays-rs".to_string(),
        }
    }
}

/// Terminal consumer failures; the service exits on any of these
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("broker unreachable: {0}")]
    Connect(BusError),

    #[error("topology declaration failed: {0}")]
    Topology(BusError),

    #[error("failed to start consuming: {0}")]
    Subscribe(BusError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    Connecting,
    Bound,
    Consuming,
    Reconnecting,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Connecting => "connecting",
            ConsumerState::Bound => "bound",
            ConsumerState::Consuming => "consuming",
            ConsumerState::Reconnecting => "reconnecting",
        }
    }
}

/// How a single delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handler succeeded; acked
    Applied(Applied),
    /// Undecodable, invalid or unrecognized; acked without touching the store
    Dropped,
    /// Handler failed; nacked with requeue
    Requeued,
}

#[derive(Debug, thiserror::Error)]
enum ApplyError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("handler timed out after {0:?}")]
    Timeout(Duration),
}

/// Ends one connection's lifetime
enum SessionEnd {
    /// Channel is gone; reconnect
    Transport(BusError),
    /// Reconnecting cannot help
    Fatal(ConsumerError),
}

pub struct EventConsumer {
    connector: Arc<dyn Connector>,
    topology: Topology,
    store: Arc<dyn BirthdayStore>,
    config: ConsumerConfig,
    state: watch::Sender<ConsumerState>,
}

impl EventConsumer {
    pub fn new(
        connector: Arc<dyn Connector>,
        topology: Topology,
        store: Arc<dyn BirthdayStore>,
        config: ConsumerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Connecting);
        Self {
            connector,
            topology,
            store,
            config,
            state,
        }
    }

    /// Observe lifecycle transitions
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConsumerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = previous.as_str(), to = next.as_str(), "Consumer state changed");
        }
    }

    /// Run on a background task, logging the terminal error if there is one
    pub fn spawn(self) -> JoinHandle<Result<(), ConsumerError>> {
        tokio::spawn(async move {
            let result = self.run().await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "Event consumer stopped");
            }
            result
        })
    }

    /// Connect, declare topology and consume until a terminal failure
    ///
    /// Transport failures while consuming lead back to `Connecting`; only an
    /// exhausted connect retry or a topology rejection ends the loop.
    pub async fn run(&self) -> Result<(), ConsumerError> {
        loop {
            self.set_state(ConsumerState::Connecting);
            let bus = connect_with_retry(self.connector.as_ref(), &self.config.retry)
                .await
                .map_err(ConsumerError::Connect)?;

            let end = self.consume_session(bus.as_ref()).await;

            if let Err(e) = bus.close().await {
                tracing::debug!(error = %e, "Closing failed channel");
            }

            match end {
                SessionEnd::Transport(e) => {
                    tracing::warn!(error = %e, "Broker channel lost, reconnecting");
                }
                SessionEnd::Fatal(e) => return Err(e),
            }

            self.set_state(ConsumerState::Reconnecting);
        }
    }

    async fn consume_session(&self, bus: &dyn EventBus) -> SessionEnd {
        let queue = match self.topology.initialize(bus).await {
            Ok(queue) => queue,
            Err(e) if e.is_transport() => return SessionEnd::Transport(e),
            Err(e) => return SessionEnd::Fatal(ConsumerError::Topology(e)),
        };
        self.set_state(ConsumerState::Bound);

        let mut deliveries = match bus.consume(&queue.name, &self.config.consumer_tag).await {
            Ok(stream) => stream,
            Err(e) if e.is_transport() => return SessionEnd::Transport(e),
            Err(e) => return SessionEnd::Fatal(ConsumerError::Subscribe(e)),
        };
        self.set_state(ConsumerState::Consuming);
        tracing::info!(queue = %queue.name, pending = queue.message_count, "Consuming events");

        while let Some(next) = deliveries.next().await {
            let delivery = match next {
                Ok(delivery) => delivery,
                Err(e) => return SessionEnd::Transport(e),
            };

            if let Err(e) = self.handle_delivery(delivery).await {
                return SessionEnd::Transport(e);
            }
        }

        SessionEnd::Transport(BusError::ConsumeError("delivery stream ended".to_string()))
    }

    /// Decode, dispatch and settle one delivery
    ///
    /// `Err` means the delivery could not be settled and the channel must be
    /// recreated; the broker will redeliver the message.
    pub async fn handle_delivery(&self, delivery: Delivery) -> BusResult<Disposition> {
        let envelope = match EventEnvelope::<serde_json::Value>::from_slice(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    routing_key = %delivery.routing_key,
                    redelivered = delivery.redelivered,
                    error = %e,
                    "Dropping undecodable message"
                );
                delivery.ack().await?;
                return Ok(Disposition::Dropped);
            }
        };

        let span = tracing::info_span!(
            "process_event",
            trace_id = %envelope.trace_id,
            event_type = %envelope.event_type,
            routing_key = %delivery.routing_key,
            redelivered = delivery.redelivered
        );

        self.process(envelope, delivery).instrument(span).await
    }

    async fn process(
        &self,
        envelope: EventEnvelope<serde_json::Value>,
        delivery: Delivery,
    ) -> BusResult<Disposition> {
        let event = match UserEvent::from_envelope(&envelope) {
            Ok(event) => event,
            Err(EventDecodeError::Unrecognized(event_type)) => {
                tracing::warn!(event_type = %event_type, "Ignoring unrecognized event type");
                delivery.ack().await?;
                return Ok(Disposition::Dropped);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping invalid event");
                delivery.ack().await?;
                return Ok(Disposition::Dropped);
            }
        };

        match self.apply(&event).await {
            Ok(applied) => {
                delivery.ack().await?;
                tracing::debug!(user_id = %event.user_id(), outcome = ?applied, "Event applied");
                Ok(Disposition::Applied(applied))
            }
            Err(e) => {
                tracing::error!(
                    user_id = %event.user_id(),
                    error = %e,
                    delay_ms = self.config.redelivery_delay.as_millis() as u64,
                    "Event handling failed, requeueing"
                );
                tokio::time::sleep(self.config.redelivery_delay).await;
                delivery.nack(true).await?;
                Ok(Disposition::Requeued)
            }
        }
    }

    async fn apply(&self, event: &UserEvent) -> Result<Applied, ApplyError> {
        let handled = dispatch(self.store.as_ref(), event);
        match self.config.handler_timeout {
            Some(limit) => tokio::time::timeout(limit, handled)
                .await
                .map_err(|_| ApplyError::Timeout(limit))?
                .map_err(ApplyError::from),
            None => handled.await.map_err(ApplyError::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{birthday_topology, routing_key, EXCHANGE, QUEUE, USER_CREATED};
    use crate::store::InMemoryStore;
    use event_bus::InMemoryBroker;
    use serde_json::json;

    fn fast_config() -> ConsumerConfig {
        ConsumerConfig {
            retry: RetryConfig::fixed(3, Duration::from_millis(5)),
            redelivery_delay: Duration::from_millis(5),
            handler_timeout: Some(Duration::from_secs(1)),
            consumer_tag: "test".to_string(),
        }
    }

    async fn next_delivery(
        broker: &InMemoryBroker,
        body: Vec<u8>,
    ) -> (Arc<dyn EventBus>, Delivery) {
        let bus = broker.connect().await.unwrap();
        birthday_topology().initialize(bus.as_ref()).await.unwrap();
        bus.publish(EXCHANGE, &routing_key(USER_CREATED), body).await.unwrap();

        let mut stream = bus.consume(QUEUE, "test").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        (bus, delivery)
    }

    fn consumer(broker: &InMemoryBroker, store: Arc<InMemoryStore>) -> EventConsumer {
        EventConsumer::new(Arc::new(broker.clone()), birthday_topology(), store, fast_config())
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(serde_json::to_value(ConsumerState::Consuming).unwrap(), json!("consuming"));
        assert_eq!(ConsumerState::Reconnecting.as_str(), "reconnecting");
    }

    #[tokio::test]
    async fn test_garbage_body_is_acked_and_dropped() {
        let broker = InMemoryBroker::new();
        let store = Arc::new(InMemoryStore::new());
        let (_bus, delivery) = next_delivery(&broker, b"not json".to_vec()).await;

        let outcome = consumer(&broker, store.clone()).handle_delivery(delivery).await.unwrap();

        assert_eq!(outcome, Disposition::Dropped);
        assert_eq!(broker.queue_depth(QUEUE).await, Some((0, 0)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_valid_event_is_applied_then_acked() {
        let broker = InMemoryBroker::new();
        let store = Arc::new(InMemoryStore::new());
        let body = EventEnvelope::new(USER_CREATED, json!({"id": "u1"})).to_bytes().unwrap();
        let (_bus, delivery) = next_delivery(&broker, body).await;

        let outcome = consumer(&broker, store.clone()).handle_delivery(delivery).await.unwrap();

        assert_eq!(outcome, Disposition::Applied(Applied::Created));
        assert_eq!(broker.queue_depth(QUEUE).await, Some((0, 0)));
        assert!(store.get("u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ack_on_closed_channel_is_transport_error() {
        let broker = InMemoryBroker::new();
        let store = Arc::new(InMemoryStore::new());
        let body = EventEnvelope::new(USER_CREATED, json!({"id": "u1"})).to_bytes().unwrap();
        let (_bus, delivery) = next_delivery(&broker, body).await;

        broker.disconnect_all().await;
        let err = consumer(&broker, store).handle_delivery(delivery).await.unwrap_err();

        assert!(err.is_transport());
        // Requeued by the broker for the next connection
        assert_eq!(broker.queue_depth(QUEUE).await, Some((1, 0)));
    }

    #[tokio::test]
    async fn test_run_fails_when_broker_never_answers() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(100).await;

        let err = consumer(&broker, Arc::new(InMemoryStore::new())).run().await.unwrap_err();

        assert!(matches!(
            err,
            ConsumerError::Connect(BusError::RetriesExhausted { attempts: 3, .. })
        ));
    }
}
