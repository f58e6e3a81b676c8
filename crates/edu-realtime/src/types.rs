//! Core type definitions: identifiers, topics and message shapes.

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HandlerError, RealtimeResult};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a new unique identifier.
            pub fn new() -> Self {
                Self(ulid::Ulid::new().to_string())
            }

            /// Get the inner string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Opaque identifier of a [`Subscription`](crate::subscription::Subscription).
    SubscriptionId
);

string_id!(
    /// Correlates an outbound message with its acknowledgment.
    CorrelationId
);

/// Named logical stream. Compared by exact, case-sensitive match.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Create a new topic from a string.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Message type used for handler routing.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    /// Wire type of explicit acknowledgments.
    pub const ACK: &'static str = "ack";
    /// Wire type of system-level notifications.
    pub const NOTIFICATION: &'static str = "notification";

    /// Create a new event type.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Message as it appears on the wire, before classification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
}

/// Application event pushed by the transport.
#[derive(Clone, Debug, PartialEq)]
pub struct EventMessage {
    pub event_type: EventType,
    pub topic: Option<Topic>,
    pub payload: Value,
    pub correlation_id: Option<CorrelationId>,
}

/// Explicit acknowledgment of an earlier send.
#[derive(Clone, Debug, PartialEq)]
pub struct AckMessage {
    pub correlation_id: CorrelationId,
    pub topic: Option<Topic>,
    pub payload: Value,
}

/// System-level notification meant for the user.
#[derive(Clone, Debug, PartialEq)]
pub struct NotificationMessage {
    pub topic: Option<Topic>,
    /// Severity as sent by the server; unknown values are kept verbatim.
    pub severity: String,
    pub message: String,
    pub payload: Value,
}

/// Classified inbound message.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundMessage {
    Event(EventMessage),
    Ack(AckMessage),
    Notification(NotificationMessage),
}

impl InboundMessage {
    /// Build an application event.
    pub fn event(event_type: impl Into<EventType>, topic: Option<Topic>, payload: Value) -> Self {
        Self::Event(EventMessage {
            event_type: event_type.into(),
            topic,
            payload,
            correlation_id: None,
        })
    }

    /// Build an acknowledgment.
    pub fn ack(correlation_id: CorrelationId, payload: Value) -> Self {
        Self::Ack(AckMessage {
            correlation_id,
            topic: None,
            payload,
        })
    }

    /// Build a system notification.
    pub fn notification(severity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Notification(NotificationMessage {
            topic: None,
            severity: severity.into(),
            message: message.into(),
            payload: Value::Null,
        })
    }

    /// Classify a wire message.
    ///
    /// `ack` messages need a correlation id; without one they are treated as
    /// ordinary events.
    pub fn from_raw(raw: RawMessage) -> Self {
        let topic = raw.topic.map(Topic::from);
        let correlation_id = raw.correlation_id.map(CorrelationId::from);

        match (raw.event_type.as_str(), correlation_id) {
            (EventType::ACK, Some(correlation_id)) => Self::Ack(AckMessage {
                correlation_id,
                topic,
                payload: raw.payload,
            }),
            (EventType::NOTIFICATION, _) => {
                let severity = raw
                    .payload
                    .get("severity")
                    .and_then(Value::as_str)
                    .unwrap_or("info")
                    .to_string();
                let message = raw
                    .payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Self::Notification(NotificationMessage {
                    topic,
                    severity,
                    message,
                    payload: raw.payload,
                })
            }
            (_, correlation_id) => Self::Event(EventMessage {
                event_type: EventType::from(raw.event_type),
                topic,
                payload: raw.payload,
                correlation_id,
            }),
        }
    }

    /// Parse and classify a JSON frame.
    pub fn from_json(text: &str) -> RealtimeResult<Self> {
        let raw: RawMessage = serde_json::from_str(text).map_err(|e| {
            crate::error::RealtimeError::internal(format!("Malformed inbound message: {e}"))
        })?;
        Ok(Self::from_raw(raw))
    }

    /// Attach a topic.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<Topic>) -> Self {
        let topic = Some(topic.into());
        match &mut self {
            Self::Event(m) => m.topic = topic,
            Self::Ack(m) => m.topic = topic,
            Self::Notification(m) => m.topic = topic,
        }
        self
    }

    /// Attach a correlation id to an event. Other variants are unchanged.
    #[must_use]
    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        if let Self::Event(m) = &mut self {
            m.correlation_id = Some(id);
        }
        self
    }

    /// Routing type of this message.
    pub fn event_type(&self) -> &str {
        match self {
            Self::Event(m) => m.event_type.as_str(),
            Self::Ack(_) => EventType::ACK,
            Self::Notification(_) => EventType::NOTIFICATION,
        }
    }

    pub fn topic(&self) -> Option<&Topic> {
        match self {
            Self::Event(m) => m.topic.as_ref(),
            Self::Ack(m) => m.topic.as_ref(),
            Self::Notification(m) => m.topic.as_ref(),
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            Self::Event(m) => &m.payload,
            Self::Ack(m) => &m.payload,
            Self::Notification(m) => &m.payload,
        }
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            Self::Event(m) => m.correlation_id.as_ref(),
            Self::Ack(m) => Some(&m.correlation_id),
            Self::Notification(_) => None,
        }
    }
}

/// Message handed to the transport for delivery.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<Topic>,
    pub payload: Value,
    #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

/// Per-call options for `send`.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// Topic the message is published to.
    pub topic: Option<Topic>,
    /// Wait for a correlated acknowledgment.
    pub await_ack: bool,
    /// Acknowledgment timeout; falls back to the configured default.
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn topic(mut self, topic: impl Into<Topic>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    #[must_use]
    pub fn await_ack(mut self, await_ack: bool) -> Self {
        self.await_ack = await_ack;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Callback invoked with each matching inbound message.
pub type MessageCallback = Arc<dyn Fn(&InboundMessage) -> Result<(), HandlerError> + Send + Sync>;

/// Optional filter evaluated before a callback runs.
pub type MessageFilter = Arc<dyn Fn(&InboundMessage) -> bool + Send + Sync>;
