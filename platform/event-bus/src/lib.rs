//! # EventBus Abstraction
//!
//! Broker-facing messaging for services that consume routed events
//! at-least-once and publish their own lifecycle events.
//!
//! ## Model
//!
//! The abstraction follows AMQP 0-9-1: a [`Connector`] dials the broker and
//! yields a channel ([`EventBus`]); the channel declares exchanges, queues and
//! bindings, publishes, and consumes [`Delivery`] values that must be
//! acknowledged (or negatively acknowledged) explicitly.
//!
//! ## Implementations
//!
//! - **AmqpConnector / AmqpBus**: Production implementation on RabbitMQ via `lapin`
//! - **InMemoryBroker / InMemoryBus**: Process-local broker for dev/test
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{connect_with_retry, Connector, InMemoryBroker, RetryConfig, Topology};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::new();
//! let bus = connect_with_retry(&broker, &RetryConfig::default()).await?;
//!
//! let topology = Topology::topic("user_events", "birthdayQueue")
//!     .with_binding("userManagement.userCreated");
//! let queue = topology.initialize(bus.as_ref()).await?;
//!
//! let mut deliveries = bus.consume(&queue.name, "example").await?;
//! while let Some(delivery) = deliveries.next().await {
//!     let delivery = delivery?;
//!     println!("{} bytes on {}", delivery.payload.len(), delivery.routing_key);
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

mod amqp_bus;
mod connection;
mod envelope;
mod inmemory_bus;
pub mod retry;
mod topology;

pub use amqp_bus::{AmqpBus, AmqpConnector};
pub use connection::connect_with_retry;
pub use envelope::{validate_envelope_fields, EnvelopeError, EventEnvelope};
pub use inmemory_bus::{InMemoryBroker, InMemoryBus};
pub use retry::{BackoffStrategy, RetryConfig};
pub use topology::{ExchangeKind, ExchangeSpec, QueueInfo, QueueSpec, Topology};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to consume from queue: {0}")]
    ConsumeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("failed to declare topology: {0}")]
    DeclareError(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to acknowledge delivery: {0}")]
    AckError(String),

    #[error("gave up connecting after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("internal error: {0}")]
    InternalError(String),
}

impl BusError {
    /// Whether the error means the channel is unusable and must be recreated
    pub fn is_transport(&self) -> bool {
        matches!(self, BusError::ConnectionError(_) | BusError::AckError(_))
    }
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Stream of deliveries from a queue subscription
///
/// An `Err` item means the underlying channel failed; the stream ends after it.
pub type DeliveryStream = BoxStream<'static, BusResult<Delivery>>;

/// Settles a single delivery with the broker
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> BusResult<()>;

    async fn nack(&self, requeue: bool) -> BusResult<()>;
}

/// A message delivered from a queue, pending acknowledgement
pub struct Delivery {
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Raw message body
    pub payload: Vec<u8>,
    /// True when the broker has delivered this message before
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        exchange: String,
        routing_key: String,
        payload: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            exchange,
            routing_key,
            payload,
            redelivered,
            acker,
        }
    }

    /// Confirm the message was handled; the broker forgets it
    pub async fn ack(self) -> BusResult<()> {
        self.acker.ack().await
    }

    /// Reject the message; with `requeue` the broker delivers it again
    pub async fn nack(self, requeue: bool) -> BusResult<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// A broker channel: topology declaration, publishing and consuming
///
/// A channel is owned by one component at a time (the consumer task or the
/// publisher); it is not shared between them.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Declare an exchange; identical redeclaration is a no-op
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BusResult<()>;

    /// Declare a queue; identical redeclaration is a no-op
    async fn declare_queue(&self, spec: &QueueSpec) -> BusResult<QueueInfo>;

    /// Bind a queue to an exchange for a routing key pattern
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()>;

    /// Publish a message to an exchange under a routing key
    ///
    /// # Returns
    /// * `Ok(())` once the broker accepted the message
    /// * `Err(BusError)` if publishing failed
    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Start consuming a queue with manual acknowledgement
    async fn consume(&self, queue: &str, consumer_tag: &str) -> BusResult<DeliveryStream>;

    /// Close the channel and its connection
    async fn close(&self) -> BusResult<()>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}

/// Dials the broker and opens a channel
#[async_trait]
pub trait Connector: Send + Sync {
    /// Make one connection attempt
    async fn connect(&self) -> BusResult<Arc<dyn EventBus>>;

    /// Broker address for logs, without credentials
    fn endpoint(&self) -> String;
}
