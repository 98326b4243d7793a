//! Typed view of the identity service's lifecycle events
//!
//! The envelope's `eventType` selects the payload shape; payloads are checked
//! here so malformed events are rejected before any handler runs.

use super::{USER_CREATED, USER_DELETED};
use crate::models::UserRef;
use event_bus::EventEnvelope;

#[derive(Debug, thiserror::Error)]
pub enum EventDecodeError {
    #[error("unrecognized event type '{0}'")]
    Unrecognized(String),

    #[error("invalid payload for {event_type}: {reason}")]
    InvalidPayload { event_type: String, reason: String },
}

/// Events this service reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserEvent {
    Created(UserRef),
    Deleted(UserRef),
}

impl UserEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            UserEvent::Created(_) => USER_CREATED,
            UserEvent::Deleted(_) => USER_DELETED,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            UserEvent::Created(user) | UserEvent::Deleted(user) => &user.id,
        }
    }

    /// Classify a decoded envelope and validate its payload
    pub fn from_envelope(
        envelope: &EventEnvelope<serde_json::Value>,
    ) -> Result<Self, EventDecodeError> {
        match envelope.event_type.as_str() {
            USER_CREATED => parse_user_ref(USER_CREATED, &envelope.payload).map(UserEvent::Created),
            USER_DELETED => parse_user_ref(USER_DELETED, &envelope.payload).map(UserEvent::Deleted),
            other => Err(EventDecodeError::Unrecognized(other.to_string())),
        }
    }
}

fn parse_user_ref(
    event_type: &str,
    payload: &serde_json::Value,
) -> Result<UserRef, EventDecodeError> {
    let invalid = |reason: String| EventDecodeError::InvalidPayload {
        event_type: event_type.to_string(),
        reason,
    };

    let user: UserRef =
        serde_json::from_value(payload.clone()).map_err(|e| invalid(e.to_string()))?;

    if user.id.trim().is_empty() {
        return Err(invalid("id cannot be empty".to_string()));
    }

    Ok(user)
}
