use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{
    bus::RawEnvelope,
    error::{self, PipelineError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    ProductCreated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ProductCreated => "ProductCreated",
        }
    }

    /// Payload fields, in order of preference, naming who gets notified.
    fn recipient_fields(&self) -> &'static [&'static str] {
        match self {
            EventType::ProductCreated => &["userId", "ownerId", "createdBy"],
        }
    }
}

impl FromStr for EventType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ProductCreated" => Ok(EventType::ProductCreated),
            other => Err(PipelineError::UnknownEventType {
                kind: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub event_id: String,
    pub kind: EventType,
    pub occurred_at: DateTime<Utc>,
    pub payload: Map<String, Value>,
}

impl DomainEvent {
    pub fn recipient_id(&self) -> Option<&str> {
        self.kind
            .recipient_fields()
            .iter()
            .find_map(|field| self.text(field))
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.payload
            .get(field)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    event_id: String,
    #[serde(rename = "type")]
    kind: String,
    occurred_at: DateTime<Utc>,
    #[serde(default)]
    payload: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EventDecoder;

impl EventDecoder {
    pub fn decode(&self, envelope: &RawEnvelope) -> error::Result<DomainEvent> {
        let wire: WireEvent =
            serde_json::from_slice(&envelope.payload).map_err(PipelineError::malformed)?;

        if wire.event_id.trim().is_empty() {
            return Err(PipelineError::malformed("eventId is empty"));
        }

        let event = DomainEvent {
            kind: wire.kind.parse()?,
            event_id: wire.event_id,
            occurred_at: wire.occurred_at,
            payload: wire.payload,
        };

        if event.recipient_id().is_none() {
            return Err(PipelineError::malformed(format!(
                "{} event {} has no recipient (expected one of {})",
                event.kind,
                event.event_id,
                event.kind.recipient_fields().join(", ")
            )));
        }

        Ok(event)
    }
}
