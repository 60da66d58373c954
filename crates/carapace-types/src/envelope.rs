//! Wire message and trusted Envelope types (spec.md §3, §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ErrorPayload;

/// The current envelope protocol version. Implementations must reject any
/// envelope whose `version` differs.
pub const PROTOCOL_VERSION: u32 = 1;

/// Field names reserved for the Envelope Identity set. A Wire Message
/// carrying any of these is rejected before any other validation runs.
pub const ENVELOPE_IDENTITY_FIELDS: &[&str] =
    &["id", "version", "type", "source", "timestamp", "group", "payload"];

/// The untrusted, three-field shape a container puts on the wire before the
/// pipeline runs (spec.md §3 "Wire Message").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub topic: String,
    pub correlation: String,
    pub arguments: Map<String, Value>,
}

/// Error returned when raw bytes fail to become a well-formed [`WireMessage`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum WireParseError {
    #[error("malformed JSON: {0}")]
    Json(String),
    #[error("wire message must be a JSON object")]
    NotAnObject,
    #[error("wire message contains reserved envelope-identity field: {0}")]
    ReservedField(String),
    #[error("missing or invalid required field: {0}")]
    MissingField(&'static str),
}

impl WireMessage {
    /// Parse raw bytes into a [`WireMessage`], enforcing that none of the
    /// Envelope Identity fields are present (spec.md §3 invariant: this is
    /// the only place on-wire container data enters the system).
    pub fn parse(raw: &[u8]) -> std::result::Result<Self, WireParseError> {
        let value: Value =
            serde_json::from_slice(raw).map_err(|e| WireParseError::Json(e.to_string()))?;
        let obj = value.as_object().ok_or(WireParseError::NotAnObject)?;

        for reserved in ENVELOPE_IDENTITY_FIELDS {
            if obj.contains_key(*reserved) {
                return Err(WireParseError::ReservedField((*reserved).to_string()));
            }
        }

        let topic = obj
            .get("topic")
            .and_then(Value::as_str)
            .ok_or(WireParseError::MissingField("topic"))?
            .to_string();
        let correlation = obj
            .get("correlation")
            .and_then(Value::as_str)
            .ok_or(WireParseError::MissingField("correlation"))?
            .to_string();
        let arguments = obj
            .get("arguments")
            .and_then(Value::as_object)
            .ok_or(WireParseError::MissingField("arguments"))?
            .clone();

        Ok(WireMessage {
            topic,
            correlation,
            arguments,
        })
    }
}

/// The discriminant of an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    Request,
    Response,
    Event,
}

/// Payload carried by a Request or Response envelope.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RequestResponsePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// The trusted message shape produced by the host after combining wire data
/// with session state (spec.md §3 "Envelope"). `source` and `group` are
/// taken from session state, never from the wire -- structurally, there is
/// no field on [`WireMessage`] a caller could set to influence them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub topic: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub group: String,
    pub payload: RequestResponsePayload,
}

impl Envelope {
    /// Build a Request envelope from a [`WireMessage`] and session state.
    /// Stage 1 of the request pipeline (spec.md §4.8).
    pub fn new_request(
        wire: &WireMessage,
        source: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Envelope {
            id: Uuid::new_v4(),
            version: PROTOCOL_VERSION,
            kind: EnvelopeType::Request,
            topic: wire.topic.clone(),
            source: source.into(),
            correlation: Some(wire.correlation.clone()),
            timestamp: Utc::now(),
            group: group.into(),
            payload: RequestResponsePayload {
                arguments: Some(wire.arguments.clone()),
                result: None,
                error: None,
            },
        }
    }

    /// Build a successful Response envelope answering `request`.
    pub fn new_response_ok(request: &Envelope, result: Value) -> Self {
        Envelope {
            id: Uuid::new_v4(),
            version: PROTOCOL_VERSION,
            kind: EnvelopeType::Response,
            topic: request.topic.clone(),
            source: "core".to_string(),
            correlation: request.correlation.clone(),
            timestamp: Utc::now(),
            group: request.group.clone(),
            payload: RequestResponsePayload {
                arguments: None,
                result: Some(result),
                error: None,
            },
        }
    }

    /// Build a failed Response envelope answering `request`.
    pub fn new_response_err(request: &Envelope, error: ErrorPayload) -> Self {
        Envelope {
            id: Uuid::new_v4(),
            version: PROTOCOL_VERSION,
            kind: EnvelopeType::Response,
            topic: request.topic.clone(),
            source: "core".to_string(),
            correlation: request.correlation.clone(),
            timestamp: Utc::now(),
            group: request.group.clone(),
            payload: RequestResponsePayload {
                arguments: None,
                result: None,
                error: Some(error),
            },
        }
    }

    /// Build an Event envelope from an external producer.
    pub fn new_event(
        topic: impl Into<String>,
        source: impl Into<String>,
        group: impl Into<String>,
        payload: Value,
    ) -> Self {
        Envelope {
            id: Uuid::new_v4(),
            version: PROTOCOL_VERSION,
            kind: EnvelopeType::Event,
            topic: topic.into(),
            source: source.into(),
            correlation: None,
            timestamp: Utc::now(),
            group: group.into(),
            payload: RequestResponsePayload {
                arguments: payload.as_object().cloned(),
                result: None,
                error: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_message_rejects_identity_fields() {
        let raw =
            br#"{"topic":"tool.invoke.echo","correlation":"c1","arguments":{},"group":"admin"}"#;
        let err = WireMessage::parse(raw).unwrap_err();
        assert!(matches!(err, WireParseError::ReservedField(f) if f == "group"));
    }

    #[test]
    fn wire_message_parses_happy_path() {
        let raw = br#"{"topic":"tool.invoke.echo","correlation":"c1","arguments":{"text":"hi"}}"#;
        let wire = WireMessage::parse(raw).unwrap();
        assert_eq!(wire.topic, "tool.invoke.echo");
        assert_eq!(wire.correlation, "c1");
    }

    #[test]
    fn request_envelope_takes_group_and_source_from_session_not_wire() {
        let raw = br#"{"topic":"tool.invoke.echo","correlation":"c1","arguments":{}}"#;
        let wire = WireMessage::parse(raw).unwrap();
        let envelope = Envelope::new_request(&wire, "container-123", "demo");
        assert_eq!(envelope.source, "container-123");
        assert_eq!(envelope.group, "demo");
        assert_eq!(envelope.correlation.as_deref(), Some("c1"));
    }
}
