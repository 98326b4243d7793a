//! Fire-and-forget publication of this service's own lifecycle events

use super::{routing_key, EXCHANGE};
use event_bus::{
    BusError, BusResult, Connector, EnvelopeError, EventBus, EventEnvelope, ExchangeSpec,
};
use serde::Serialize;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Envelope metadata stamped on every outbound event
#[derive(Debug, Clone)]
pub struct EnvelopeOrigin {
    pub service_origin: String,
    pub version: String,
    pub environment: String,
}

impl Default for EnvelopeOrigin {
    fn default() -> Self {
        Self {
            service_origin: "BirthdayService".to_string(),
            version: "1.0".to_string(),
            environment: "production".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
}

/// An encoded event waiting for the background worker
struct Outbound {
    event_type: &'static str,
    trace_id: Uuid,
    body: Vec<u8>,
}

/// Publishes on a channel of its own, opened on first use and reused after
///
/// A failed publish discards the channel; the next publish makes a single
/// fresh connection attempt. Nothing is retried. Detached publishes go
/// through one worker so they reach the exchange in submission order.
pub struct EventPublisher {
    connector: Arc<dyn Connector>,
    exchange: ExchangeSpec,
    origin: EnvelopeOrigin,
    timeout: Duration,
    channel: Mutex<Option<Arc<dyn EventBus>>>,
    outbox: OnceLock<mpsc::UnboundedSender<Outbound>>,
}

impl EventPublisher {
    pub fn new(connector: Arc<dyn Connector>, origin: EnvelopeOrigin, timeout: Duration) -> Self {
        Self {
            connector,
            exchange: ExchangeSpec::topic(EXCHANGE),
            origin,
            timeout,
            channel: Mutex::new(None),
            outbox: OnceLock::new(),
        }
    }

    /// Publish and report the outcome
    ///
    /// Returns the envelope's trace id once the broker accepted the message.
    pub async fn try_publish<T: Serialize>(
        &self,
        event_type: &str,
        payload: &T,
    ) -> Result<Uuid, PublishError> {
        let (trace_id, body) = self.encode(event_type, payload)?;
        self.deliver(&routing_key(event_type), body).await?;
        Ok(trace_id)
    }

    /// Publish, logging any failure; the event is lost if it fails
    pub async fn publish<T: Serialize>(&self, event_type: &str, payload: &T) {
        match self.try_publish(event_type, payload).await {
            Ok(trace_id) => log_published(event_type, trace_id),
            Err(e) => log_failed(event_type, &e),
        }
    }

    /// Queue an event for the background worker so the caller never waits on
    /// the broker
    ///
    /// The envelope is built here, so its timestamp is the time of the call.
    pub fn publish_detached<T: Serialize>(self: &Arc<Self>, event_type: &'static str, payload: &T) {
        let (trace_id, body) = match self.encode(event_type, payload) {
            Ok(encoded) => encoded,
            Err(e) => {
                log_failed(event_type, &PublishError::from(e));
                return;
            }
        };

        let outbox = self.outbox.get_or_init(|| self.start_worker());
        let queued = outbox.send(Outbound {
            event_type,
            trace_id,
            body,
        });
        if queued.is_err() {
            tracing::warn!(event_type = %event_type, "Publisher worker stopped, event dropped");
        }
    }

    fn start_worker(self: &Arc<Self>) -> mpsc::UnboundedSender<Outbound> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        let publisher: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                let Some(publisher) = publisher.upgrade() else {
                    break;
                };
                let routing_key = routing_key(outbound.event_type);
                match publisher.deliver(&routing_key, outbound.body).await {
                    Ok(()) => log_published(outbound.event_type, outbound.trace_id),
                    Err(e) => log_failed(outbound.event_type, &e),
                }
            }
            tracing::debug!("Publisher worker stopped");
        });

        tx
    }

    fn encode<T: Serialize>(
        &self,
        event_type: &str,
        payload: &T,
    ) -> Result<(Uuid, Vec<u8>), EnvelopeError> {
        let envelope = EventEnvelope::new(event_type, payload)
            .with_version(self.origin.version.as_str())
            .with_service_origin(self.origin.service_origin.as_str())
            .with_environment(self.origin.environment.as_str());
        Ok((envelope.trace_id, envelope.to_bytes()?))
    }

    /// Publish under the channel lock; a failure closes the channel it used
    async fn deliver(&self, routing_key: &str, body: Vec<u8>) -> Result<(), PublishError> {
        let mut channel = self.channel.lock().await;

        let sent = tokio::time::timeout(
            self.timeout,
            self.send_on(&mut channel, routing_key, body),
        )
        .await;

        let err = match sent {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => PublishError::Bus(e),
            Err(_) => PublishError::Timeout(self.timeout),
        };

        if let Some(bus) = channel.take() {
            close_quietly(bus.as_ref(), "Closing failed publisher channel").await;
        }
        Err(err)
    }

    async fn send_on(
        &self,
        channel: &mut Option<Arc<dyn EventBus>>,
        routing_key: &str,
        body: Vec<u8>,
    ) -> BusResult<()> {
        let bus = match channel.as_ref() {
            Some(bus) => Arc::clone(bus),
            None => {
                let bus = self.connector.connect().await?;
                if let Err(e) = bus.declare_exchange(&self.exchange).await {
                    close_quietly(bus.as_ref(), "Closing publisher channel after declare failure")
                        .await;
                    return Err(e);
                }
                tracing::debug!(
                    endpoint = %self.connector.endpoint(),
                    "Publisher channel opened"
                );
                *channel = Some(Arc::clone(&bus));
                bus
            }
        };

        bus.publish(&self.exchange.name, routing_key, body).await
    }
}

async fn close_quietly(bus: &dyn EventBus, message: &'static str) {
    if let Err(e) = bus.close().await {
        tracing::debug!(error = %e, "{}", message);
    }
}

fn log_published(event_type: &str, trace_id: Uuid) {
    tracing::info!(event_type = %event_type, trace_id = %trace_id, "Event published");
}

fn log_failed(event_type: &str, error: &PublishError) {
    tracing::warn!(event_type = %event_type, error = %error, "Failed to publish event");
}
