pub mod consumer;
pub mod handlers;
pub mod publisher;
pub mod user_events;

pub use consumer::{ConsumerConfig, ConsumerError, ConsumerState, Disposition, EventConsumer};
pub use handlers::{dispatch, Applied};
pub use publisher::{EnvelopeOrigin, EventPublisher, PublishError};
pub use user_events::{EventDecodeError, UserEvent};

use event_bus::Topology;

/// Exchange shared with the identity service
pub const EXCHANGE: &str = "user_events";

/// Durable queue owned by this service
pub const QUEUE: &str = "birthdayQueue";

pub const ROUTING_KEY_PREFIX: &str = "userManagement";

// Consumed
pub const USER_CREATED: &str = "userCreated";
pub const USER_DELETED: &str = "userDeleted";

// Published
pub const BIRTHDAY_CREATED: &str = "birthdayCreated";
pub const BIRTHDAY_UPDATED: &str = "birthdayUpdated";
pub const BIRTHDAY_DELETED: &str = "birthdayDeleted";

/// Routing key for an event type, used both to publish and to bind
pub fn routing_key(event_type: &str) -> String {
    format!("{}.{}", ROUTING_KEY_PREFIX, event_type)
}

/// Exchange, queue and one binding per consumed event type
pub fn birthday_topology() -> Topology {
    Topology::topic(EXCHANGE, QUEUE)
        .with_binding(routing_key(USER_CREATED))
        .with_binding(routing_key(USER_DELETED))
}
