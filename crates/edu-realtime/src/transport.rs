//! Contracts the client needs from the outside world: the push transport,
//! the degraded-mode polling endpoint, and the sink the transport reports
//! inbound traffic through.

use std::{collections::BTreeSet, fmt};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    error::{RealtimeError, RealtimeResult},
    state::ConnectionEpoch,
    types::{InboundMessage, OutboundMessage, Topic},
};

/// Handle for a wire-level subscription, issued by the provider.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WireHandle(String);

impl WireHandle {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WireHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Something the transport observed on the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// An inbound message.
    Message(InboundMessage),
    /// The connection was lost without the client asking for it.
    Closed { reason: String },
}

/// Channel the provider reports inbound traffic through.
///
/// A sink is bound to one connection epoch. Once the client has moved on to
/// a newer connection, or stopped being connected, anything delivered
/// through an old sink is discarded.
#[derive(Clone)]
pub struct EventSink {
    epoch: ConnectionEpoch,
    tx: mpsc::UnboundedSender<(ConnectionEpoch, TransportEvent)>,
}

impl EventSink {
    pub(crate) fn new(
        epoch: ConnectionEpoch,
        tx: mpsc::UnboundedSender<(ConnectionEpoch, TransportEvent)>,
    ) -> Self {
        Self { epoch, tx }
    }

    /// Report an inbound message. Returns `false` if the client is gone.
    pub fn deliver(&self, message: InboundMessage) -> bool {
        self.emit(TransportEvent::Message(message))
    }

    /// Report an unsolicited connection loss.
    pub fn closed(&self, reason: impl Into<String>) -> bool {
        self.emit(TransportEvent::Closed {
            reason: reason.into(),
        })
    }

    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.epoch, event)).is_ok()
    }

    pub fn epoch(&self) -> ConnectionEpoch {
        self.epoch
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("epoch", &self.epoch)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Abstract bidirectional push channel.
///
/// Implementations only move bytes; reconnection, subscription bookkeeping
/// and acknowledgment tracking all live in the client.
#[async_trait]
pub trait TransportProvider: Send + Sync + 'static {
    /// Perform the handshake. Inbound traffic for this connection goes to
    /// `sink`.
    ///
    /// Failures should be [`RealtimeError::ConnectionFailed`],
    /// [`RealtimeError::AuthFailed`] or [`RealtimeError::ConnectionTimeout`];
    /// anything else is reported as a connection failure.
    async fn connect(&self, token: Option<&str>, sink: EventSink) -> RealtimeResult<()>;

    /// Close the connection.
    async fn disconnect(&self, reason: &str);

    /// Subscribe to `topic` at the wire level.
    async fn subscribe(&self, topic: &Topic) -> RealtimeResult<WireHandle>;

    /// Drop a wire-level subscription.
    async fn unsubscribe(&self, handle: &WireHandle) -> RealtimeResult<()>;

    /// Hand an outbound message to the wire.
    async fn send(&self, message: OutboundMessage) -> RealtimeResult<()>;

    /// Whether [`reauthenticate`](Self::reauthenticate) can swap credentials
    /// on a live connection.
    fn supports_reauthentication(&self) -> bool {
        false
    }

    /// Present a fresh token on the live connection without tearing it down.
    async fn reauthenticate(&self, _token: &str) -> RealtimeResult<()> {
        Err(RealtimeError::auth(
            "transport does not support in-place re-authentication",
        ))
    }

    /// Name used in log output.
    fn name(&self) -> &'static str {
        "transport"
    }
}

/// Request/response endpoint used while the push transport is unavailable.
#[async_trait]
pub trait PollingSource: Send + Sync + 'static {
    /// Fetch whatever happened on `topics` since the previous poll.
    async fn poll(&self, topics: &BTreeSet<Topic>) -> RealtimeResult<Vec<InboundMessage>>;
}
