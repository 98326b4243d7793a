//! RabbitMQ implementation of the EventBus traits

use crate::{
    Acknowledge, BusError, BusResult, Connector, Delivery, DeliveryStream, EventBus,
    ExchangeKind, ExchangeSpec, QueueInfo, QueueSpec,
};
use async_trait::async_trait;
use futures::stream::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;

/// Dials RabbitMQ and opens one channel per connection
///
/// # Example
/// ```rust,no_run
/// use event_bus::{AmqpConnector, Connector};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let connector = AmqpConnector::new("amqp://rabbitmq:5672/");
/// let bus = connector.connect().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    url: String,
    prefetch: u16,
}

impl AmqpConnector {
    /// Connector with a prefetch of one, so deliveries are handed out strictly
    /// one at a time
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            prefetch: 1,
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> BusResult<Arc<dyn EventBus>> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::ConnectionError(format!("failed to open channel: {}", e)))?;

        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::ConnectionError(format!("failed to set prefetch: {}", e)))?;

        tracing::info!(endpoint = %self.endpoint(), "Connected to RabbitMQ and channel opened");

        Ok(Arc::new(AmqpBus {
            connection,
            channel,
        }))
    }

    fn endpoint(&self) -> String {
        redact_credentials(&self.url)
    }
}

/// Strip `user:password@` from an AMQP URL
fn redact_credentials(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***@{}", &url[..scheme_end + 3], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

/// EventBus implementation on a `lapin` channel
///
/// Owns the connection so it lives as long as the channel does.
pub struct AmqpBus {
    connection: Connection,
    channel: Channel,
}

/// Failures caused by a dead channel become `ConnectionError` so callers
/// reconnect; anything else is reported through `otherwise`
fn channel_error(what: String, e: lapin::Error, otherwise: fn(String) -> BusError) -> BusError {
    match e {
        lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::IOError(_) => BusError::ConnectionError(format!("{}: {}", what, e)),
        e => otherwise(format!("{}: {}", what, e)),
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

#[async_trait]
impl EventBus for AmqpBus {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BusResult<()> {
        let options = ExchangeDeclareOptions {
            durable: spec.durable,
            ..ExchangeDeclareOptions::default()
        };

        self.channel
            .exchange_declare(&spec.name, exchange_kind(spec.kind), options, FieldTable::default())
            .await
            .map_err(|e| {
                channel_error(format!("exchange '{}'", spec.name), e, BusError::DeclareError)
            })
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BusResult<QueueInfo> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            ..QueueDeclareOptions::default()
        };

        let queue = self
            .channel
            .queue_declare(&spec.name, options, FieldTable::default())
            .await
            .map_err(|e| {
                channel_error(format!("queue '{}'", spec.name), e, BusError::DeclareError)
            })?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                channel_error(
                    format!("binding '{}' -> '{}' ({})", exchange, queue, routing_key),
                    e,
                    BusError::DeclareError,
                )
            })
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> BusResult<()> {
        let properties = BasicProperties::default().with_content_type("application/json".into());

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BusResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| channel_error(format!("queue '{}'", queue), e, BusError::ConsumeError))?;

        // Convert lapin deliveries to bus deliveries
        let stream = consumer.map(|result| {
            result
                .map(|delivery| {
                    Delivery::new(
                        delivery.exchange.as_str().to_string(),
                        delivery.routing_key.as_str().to_string(),
                        delivery.data,
                        delivery.redelivered,
                        Box::new(AmqpAcker {
                            acker: delivery.acker,
                        }),
                    )
                })
                .map_err(|e| BusError::ConnectionError(e.to_string()))
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> BusResult<()> {
        // Closing the connection closes the channel; a channel error here just
        // means it is already gone.
        if let Err(e) = self.channel.close(200, "closing").await {
            tracing::debug!(error = %e, "Channel already closed");
        }
        self.connection
            .close(200, "closing")
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> BusResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> BusResult<()> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };
        self.acker
            .nack(options)
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }
}
