//! In-memory broker implementing the EventBus traits for testing and development

use crate::{
    Acknowledge, BusError, BusResult, Connector, Delivery, DeliveryStream, EventBus,
    ExchangeKind, ExchangeSpec, QueueInfo, QueueSpec,
};
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    redelivered: bool,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    // delivery tag -> (channel id, message)
    unacked: BTreeMap<u64, (u64, StoredMessage)>,
    consumers: Vec<(u64, String)>,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: BTreeMap::new(),
            consumers: Vec::new(),
        }
    }

    /// Return a channel's unacked messages to the head of the queue, in order
    fn requeue_channel(&mut self, channel: u64) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, (owner, _))| *owner == channel)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in tags.into_iter().rev() {
            if let Some((_, mut msg)) = self.unacked.remove(&tag) {
                msg.redelivered = true;
                self.ready.push_front(msg);
            }
        }

        self.consumers.retain(|(owner, _)| *owner != channel);
    }
}

struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    open_channels: HashSet<u64>,
    next_channel_id: u64,
    next_delivery_tag: u64,
    refuse_connections: u32,
    connection_attempts: u32,
}

impl BrokerState {
    fn ensure_open(&self, channel: u64) -> BusResult<()> {
        if self.open_channels.contains(&channel) {
            Ok(())
        } else {
            Err(BusError::ConnectionError("channel is closed".to_string()))
        }
    }

    fn route(&mut self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> BusResult<usize> {
        let kind = self
            .exchanges
            .get(exchange)
            .map(|spec| spec.kind)
            .ok_or_else(|| BusError::NotFound(format!("exchange '{}'", exchange)))?;

        let mut targets: Vec<String> = Vec::new();
        for binding in &self.bindings {
            if binding.exchange == exchange
                && InMemoryBroker::routes_to(kind, routing_key, &binding.routing_key)
                && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }

        for target in &targets {
            if let Some(queue) = self.queues.get_mut(target) {
                queue.ready.push_back(StoredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    payload: payload.clone(),
                    redelivered: false,
                });
            }
        }

        Ok(targets.len())
    }

    fn take_next(&mut self, queue: &str, channel: u64) -> BusResult<Option<(u64, StoredMessage)>> {
        self.ensure_open(channel)?;

        let tag = self.next_delivery_tag + 1;
        let state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::NotFound(format!("queue '{}'", queue)))?;

        match state.ready.pop_front() {
            Some(msg) => {
                state.unacked.insert(tag, (channel, msg.clone()));
                self.next_delivery_tag = tag;
                Ok(Some((tag, msg)))
            }
            None => Ok(None),
        }
    }
}

/// Process-local broker with AMQP-like semantics
///
/// This implementation is suitable for:
/// - Unit and integration tests (no external dependencies)
/// - Local development without a RabbitMQ container
///
/// It models exchanges (topic/direct/fanout), durable queues, bindings, and
/// per-delivery acknowledgement. Unacknowledged deliveries return to the head
/// of their queue, flagged as redelivered, when nacked with requeue or when the
/// owning channel closes. Test hooks can refuse connection attempts and force
/// every open channel closed.
///
/// # Example
/// ```rust
/// use event_bus::{Connector, EventBus, InMemoryBroker, Topology};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// let bus = broker.connect().await?;
///
/// Topology::topic("test", "q")
///     .with_binding("test.events.#")
///     .initialize(bus.as_ref())
///     .await?;
///
/// bus.publish("test", "test.events.created", b"hello".to_vec()).await?;
///
/// let mut deliveries = bus.consume("q", "example").await?;
/// let delivery = deliveries.next().await.unwrap()?;
/// assert_eq!(delivery.routing_key, "test.events.created");
/// assert_eq!(delivery.payload, b"hello");
/// delivery.ack().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connection attempts fail
    pub async fn refuse_connections(&self, count: u32) {
        self.state.lock().await.refuse_connections = count;
    }

    /// Total connection attempts seen, including refused ones
    pub async fn connection_attempts(&self) -> u32 {
        self.state.lock().await.connection_attempts
    }

    /// Close every open channel, as a broker restart or network drop would
    ///
    /// Unacknowledged deliveries are requeued and active consumer streams end
    /// with a connection error.
    pub async fn disconnect_all(&self) {
        let mut state = self.state.lock().await;
        let channels: Vec<u64> = state.open_channels.drain().collect();
        for queue in state.queues.values_mut() {
            for channel in &channels {
                queue.requeue_channel(*channel);
            }
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// `(ready, unacked)` message counts for a queue
    pub async fn queue_depth(&self, queue: &str) -> Option<(usize, usize)> {
        let state = self.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| (q.ready.len(), q.unacked.len()))
    }

    /// Number of bindings targeting a queue
    pub async fn binding_count(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.bindings.iter().filter(|b| b.queue == queue).count()
    }

    fn routes_to(kind: ExchangeKind, routing_key: &str, binding_key: &str) -> bool {
        match kind {
            ExchangeKind::Fanout => true,
            ExchangeKind::Direct => routing_key == binding_key,
            ExchangeKind::Topic => Self::matches_pattern(routing_key, binding_key),
        }
    }

    /// Check if a routing key matches a topic binding pattern
    ///
    /// Supports AMQP topic wildcards:
    /// - `*` matches exactly one word
    /// - `#` matches zero or more words
    ///
    /// # Examples
    /// - `userManagement.#` matches `userManagement.userCreated`
    /// - `*.userCreated` matches `userManagement.userCreated`
    /// - `userManagement.*` does NOT match `userManagement.user.created` (too many words)
    fn matches_pattern(routing_key: &str, pattern: &str) -> bool {
        let key_words: Vec<&str> = routing_key.split('.').collect();
        let pattern_words: Vec<&str> = pattern.split('.').collect();
        Self::match_words(&key_words, &pattern_words)
    }

    fn match_words(key: &[&str], pattern: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => {
                // `#` consumes nothing, or one word and stays in place
                Self::match_words(key, rest)
                    || (!key.is_empty() && Self::match_words(&key[1..], pattern))
            }
            Some((word, rest)) => match key.split_first() {
                Some((key_word, key_rest)) => {
                    (*word == "*" || word == key_word) && Self::match_words(key_rest, rest)
                }
                None => false,
            },
        }
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self) -> BusResult<Arc<dyn EventBus>> {
        let mut state = self.state.lock().await;
        state.connection_attempts += 1;

        if state.refuse_connections > 0 {
            state.refuse_connections -= 1;
            return Err(BusError::ConnectionError("connection refused".to_string()));
        }

        state.next_channel_id += 1;
        let channel_id = state.next_channel_id;
        state.open_channels.insert(channel_id);

        Ok(Arc::new(InMemoryBus {
            broker: self.clone(),
            channel_id,
        }))
    }

    fn endpoint(&self) -> String {
        "memory://local".to_string()
    }
}

/// A channel on an [`InMemoryBroker`]
pub struct InMemoryBus {
    broker: InMemoryBroker,
    channel_id: u64,
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BusResult<()> {
        let mut state = self.broker.state.lock().await;
        state.ensure_open(self.channel_id)?;

        match state.exchanges.get(&spec.name) {
            Some(existing) if existing != spec => Err(BusError::PreconditionFailed(format!(
                "exchange '{}' exists with different parameters",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BusResult<QueueInfo> {
        let mut state = self.broker.state.lock().await;
        state.ensure_open(self.channel_id)?;

        let queue = state
            .queues
            .entry(spec.name.clone())
            .or_insert_with(|| QueueState::new(spec.clone()));

        if queue.spec != *spec {
            return Err(BusError::PreconditionFailed(format!(
                "queue '{}' exists with different parameters",
                spec.name
            )));
        }

        Ok(QueueInfo {
            name: spec.name.clone(),
            message_count: queue.ready.len() as u32,
            consumer_count: queue.consumers.len() as u32,
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        let mut state = self.broker.state.lock().await;
        state.ensure_open(self.channel_id)?;

        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::NotFound(format!("exchange '{}'", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(BusError::NotFound(format!("queue '{}'", queue)));
        }

        let exists = state.bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
        });
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }

        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> BusResult<()> {
        let mut state = self.broker.state.lock().await;
        state
            .ensure_open(self.channel_id)
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        // Unroutable messages are dropped, as with a non-mandatory AMQP publish
        let routed = state.route(exchange, routing_key, payload)?;
        drop(state);

        if routed > 0 {
            self.broker.notify.notify_waiters();
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BusResult<DeliveryStream> {
        {
            let mut state = self.broker.state.lock().await;
            state.ensure_open(self.channel_id)?;
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BusError::NotFound(format!("queue '{}'", queue)))?;
            queue_state
                .consumers
                .push((self.channel_id, consumer_tag.to_string()));
        }

        let broker = self.broker.clone();
        let channel = self.channel_id;
        let queue = queue.to_string();

        let stream = async_stream::stream! {
            loop {
                // Registered before checking so a publish in between is not missed
                let notified = broker.notify.notified();

                let next = broker.state.lock().await.take_next(&queue, channel);

                match next {
                    Ok(Some((tag, msg))) => {
                        let acker = InMemoryAcker {
                            broker: broker.clone(),
                            queue: queue.clone(),
                            channel,
                            tag,
                        };
                        yield Ok(Delivery::new(
                            msg.exchange,
                            msg.routing_key,
                            msg.payload,
                            msg.redelivered,
                            Box::new(acker),
                        ));
                    }
                    Ok(None) => notified.await,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn close(&self) -> BusResult<()> {
        let mut state = self.broker.state.lock().await;
        if state.open_channels.remove(&self.channel_id) {
            for queue in state.queues.values_mut() {
                queue.requeue_channel(self.channel_id);
            }
        }
        drop(state);
        self.broker.notify.notify_waiters();
        Ok(())
    }
}

struct InMemoryAcker {
    broker: InMemoryBroker,
    queue: String,
    channel: u64,
    tag: u64,
}

impl InMemoryAcker {
    async fn settle(&self, requeue: Option<bool>) -> BusResult<()> {
        let mut state = self.broker.state.lock().await;
        state
            .ensure_open(self.channel)
            .map_err(|e| BusError::AckError(e.to_string()))?;

        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BusError::AckError(format!("queue '{}' is gone", self.queue)))?;

        let (_, mut msg) = queue
            .unacked
            .remove(&self.tag)
            .ok_or_else(|| BusError::AckError(format!("unknown delivery tag {}", self.tag)))?;

        if requeue == Some(true) {
            msg.redelivered = true;
            queue.ready.push_front(msg);
            drop(state);
            self.broker.notify.notify_waiters();
        }

        Ok(())
    }
}

#[async_trait]
impl Acknowledge for InMemoryAcker {
    async fn ack(&self) -> BusResult<()> {
        self.settle(None).await
    }

    async fn nack(&self, requeue: bool) -> BusResult<()> {
        self.settle(Some(requeue)).await
    }
}
