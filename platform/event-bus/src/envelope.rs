//! # Event Envelope
//!
//! Wire envelope shared by the identity service and its subscribers.
//!
//! ## Envelope Fields
//!
//! - `timestamp`: RFC 3339 time the event was generated
//! - `version`: Envelope/event schema version (e.g. "1.0")
//! - `serviceOrigin`: Service that produced the event
//! - `traceId`: UUID linking log lines across services
//! - `eventType`: Selects the payload shape (e.g. "userCreated")
//! - `environment`: Deployment environment of the producer
//! - `payload`: Event-specific data (generic type parameter)
//!
//! JSON keys are camelCase. `version`, `serviceOrigin` and `environment` are
//! informational and default to empty strings when a producer omits them;
//! `timestamp`, `traceId`, `eventType` and `payload` are mandatory.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Envelope decode/encode failures
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope JSON: {0}")]
    Malformed(String),

    #[error("invalid envelope: {0}")]
    Invalid(String),

    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

/// Standard event envelope
///
/// # Type Parameter
///
/// * `T` - The event-specific payload type; `serde_json::Value` when the
///   payload has not been interpreted yet
///
/// # Examples
///
/// ```rust
/// use event_bus::EventEnvelope;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct UserRef {
///     id: String,
/// }
///
/// let envelope = EventEnvelope::new("userCreated", UserRef { id: "u1".into() })
///     .with_service_origin("BirthdayService")
///     .with_environment("staging");
/// let bytes = envelope.to_bytes().unwrap();
/// assert!(String::from_utf8(bytes).unwrap().contains("\"eventType\":\"userCreated\""));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<T> {
    /// RFC 3339 timestamp when the event was generated
    #[serde(serialize_with = "serialize_rfc3339", deserialize_with = "deserialize_rfc3339")]
    pub timestamp: DateTime<Utc>,

    /// Event schema version
    #[serde(default)]
    pub version: String,

    /// Service that produced the event
    #[serde(default)]
    pub service_origin: String,

    /// Distributed trace identifier
    pub trace_id: Uuid,

    /// Discriminates the payload shape
    pub event_type: String,

    /// Producer's deployment environment
    #[serde(default)]
    pub environment: String,

    /// Event-specific payload
    pub payload: T,
}

impl<T> EventEnvelope<T> {
    /// Create a new envelope with a fresh trace id and the current time
    ///
    /// Version defaults to "1.0"; origin and environment are empty until set.
    pub fn new(event_type: impl Into<String>, payload: T) -> Self {
        Self {
            timestamp: Utc::now(),
            version: "1.0".to_string(),
            service_origin: String::new(),
            trace_id: Uuid::new_v4(),
            event_type: event_type.into(),
            environment: String::new(),
            payload,
        }
    }

    pub fn with_trace_id(mut self, trace_id: Uuid) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_service_origin(mut self, origin: impl Into<String>) -> Self {
        self.service_origin = origin.into();
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }
}

impl<T: Serialize> EventEnvelope<T> {
    /// Serialize to the JSON wire format
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }
}

impl<T: DeserializeOwned> EventEnvelope<T> {
    /// Decode and validate an envelope from the JSON wire format
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        validate_envelope_fields(&value).map_err(EnvelopeError::Invalid)?;

        serde_json::from_value(value).map_err(|e| EnvelopeError::Invalid(e.to_string()))
    }
}

fn serialize_rfc3339<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn deserialize_rfc3339<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(serde::de::Error::custom)
}

/// Validate the envelope fields of an undecoded message
///
/// # Validation Rules
///
/// - Body must be a JSON object
/// - `timestamp`: Must be an RFC 3339 string
/// - `traceId`: Must be a UUID string
/// - `eventType`: Must be a non-empty string
/// - `payload`: Must be present (its shape is checked per event type later)
/// - `version`, `serviceOrigin`, `environment`: Strings when present
///
/// # Errors
///
/// Returns a descriptive error string if validation fails
pub fn validate_envelope_fields(envelope: &serde_json::Value) -> Result<(), String> {
    let object = envelope
        .as_object()
        .ok_or("Envelope must be a JSON object")?;

    let timestamp = object
        .get("timestamp")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid timestamp")?;
    DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| format!("timestamp is not RFC 3339: {}", e))?;

    let trace_id = object
        .get("traceId")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid traceId")?;
    Uuid::parse_str(trace_id).map_err(|e| format!("traceId is not a UUID: {}", e))?;

    let event_type = object
        .get("eventType")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid eventType")?;

    if event_type.is_empty() {
        return Err("eventType cannot be empty".to_string());
    }

    if !object.contains_key("payload") {
        return Err("Missing payload".to_string());
    }

    for field in ["version", "serviceOrigin", "environment"] {
        if let Some(value) = object.get(field) {
            if !value.is_string() {
                return Err(format!("{} must be a string", field));
            }
        }
    }

    Ok(())
}
