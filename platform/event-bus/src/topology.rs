//! Exchange, queue and binding declarations
//!
//! Declarations are idempotent: repeating them with identical parameters (as
//! happens on every reconnect) leaves broker state unchanged.

use crate::{BusResult, EventBus};

/// Routing behaviour of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routing keys matched against dotted patterns (`*` one word, `#` zero or more)
    Topic,
    /// Routing key must equal the binding key
    Direct,
    /// Every bound queue receives every message
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    /// Non-durable topic exchange, matching how the identity service declares it
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: false,
        }
    }
}

/// Queue declaration parameters
///
/// Service queues are named, durable, shared and never auto-deleted so that
/// unacknowledged messages survive consumer restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Broker-reported queue state after declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// One exchange, one queue, and the routing keys binding them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: ExchangeSpec,
    pub queue: QueueSpec,
    pub bindings: Vec<String>,
}

impl Topology {
    /// Topic exchange + durable queue with no bindings yet
    pub fn topic(exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            exchange: ExchangeSpec::topic(exchange),
            queue: QueueSpec::durable(queue),
            bindings: Vec::new(),
        }
    }

    /// Add a binding routing key; duplicates are ignored
    pub fn with_binding(mut self, routing_key: impl Into<String>) -> Self {
        let routing_key = routing_key.into();
        if !self.bindings.contains(&routing_key) {
            self.bindings.push(routing_key);
        }
        self
    }

    /// Declare exchange, queue and all bindings on the channel
    ///
    /// Any failure is returned as-is; callers treat it as fatal because
    /// consuming without topology would silently receive nothing.
    pub async fn initialize(&self, bus: &dyn EventBus) -> BusResult<QueueInfo> {
        bus.declare_exchange(&self.exchange).await?;
        let queue = bus.declare_queue(&self.queue).await?;

        for routing_key in &self.bindings {
            bus.bind_queue(&queue.name, &self.exchange.name, routing_key)
                .await?;
        }

        tracing::info!(
            exchange = %self.exchange.name,
            queue = %queue.name,
            bindings = ?self.bindings,
            pending = queue.message_count,
            "Topology declared"
        );

        Ok(queue)
    }
}
