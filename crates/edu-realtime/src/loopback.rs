//! In-process transport that echoes published messages back to wire
//! subscribers of the same topic and acknowledges anything carrying a
//! correlation id.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tracing::debug;

use crate::{
    error::{RealtimeError, RealtimeResult},
    transport::{EventSink, TransportProvider, WireHandle},
    types::{InboundMessage, OutboundMessage, Topic},
};

#[derive(Default)]
struct Session {
    sink: Option<EventSink>,
    token: Option<String>,
    wires: HashMap<WireHandle, Topic>,
}

/// Loopback [`TransportProvider`].
#[derive(Default)]
pub struct LoopbackTransport {
    required_token: Option<String>,
    session: Mutex<Session>,
    next_handle: AtomicU64,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject handshakes and re-authentication not presenting `token`.
    pub fn requiring_token(token: impl Into<String>) -> Self {
        Self {
            required_token: Some(token.into()),
            ..Self::default()
        }
    }

    fn check_token(&self, token: Option<&str>) -> RealtimeResult<()> {
        match &self.required_token {
            Some(required) if token != Some(required.as_str()) => {
                Err(RealtimeError::auth("token rejected"))
            }
            _ => Ok(()),
        }
    }

    /// Push `message` to the client as if it came from the server.
    ///
    /// Returns `false` when there is no live connection.
    pub fn inject(&self, message: InboundMessage) -> bool {
        let sink = self.session.lock().sink.clone();
        sink.is_some_and(|sink| sink.deliver(message))
    }

    /// Simulate the server dropping the connection.
    pub fn drop_connection(&self, reason: &str) -> bool {
        let sink = {
            let mut session = self.session.lock();
            session.wires.clear();
            session.sink.take()
        };
        sink.is_some_and(|sink| sink.closed(reason))
    }

    pub fn is_connected(&self) -> bool {
        self.session.lock().sink.is_some()
    }

    /// Token presented by the last handshake or re-authentication.
    pub fn presented_token(&self) -> Option<String> {
        self.session.lock().token.clone()
    }

    pub fn wire_topics(&self) -> Vec<Topic> {
        let mut topics: Vec<_> = self.session.lock().wires.values().cloned().collect();
        topics.sort();
        topics
    }
}

#[async_trait]
impl TransportProvider for LoopbackTransport {
    async fn connect(&self, token: Option<&str>, sink: EventSink) -> RealtimeResult<()> {
        self.check_token(token)?;
        let mut session = self.session.lock();
        session.sink = Some(sink);
        session.token = token.map(str::to_string);
        session.wires.clear();
        Ok(())
    }

    async fn disconnect(&self, reason: &str) {
        let mut session = self.session.lock();
        session.sink = None;
        session.wires.clear();
        debug!(reason, "Loopback closed");
    }

    async fn subscribe(&self, topic: &Topic) -> RealtimeResult<WireHandle> {
        let mut session = self.session.lock();
        if session.sink.is_none() {
            return Err(RealtimeError::NotConnected);
        }
        let n = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let handle = WireHandle::new(format!("loopback-{n}"));
        session.wires.insert(handle.clone(), topic.clone());
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: &WireHandle) -> RealtimeResult<()> {
        self.session.lock().wires.remove(handle);
        Ok(())
    }

    async fn send(&self, message: OutboundMessage) -> RealtimeResult<()> {
        let (sink, echo) = {
            let session = self.session.lock();
            let Some(sink) = session.sink.clone() else {
                return Err(RealtimeError::send_failed("loopback is not connected"));
            };
            let echo = message
                .topic
                .as_ref()
                .is_some_and(|topic| session.wires.values().any(|wired| wired == topic));
            (sink, echo)
        };

        if echo {
            sink.deliver(InboundMessage::event(
                message.event_type.clone(),
                message.topic.clone(),
                message.payload.clone(),
            ));
        }
        if let Some(id) = message.correlation_id {
            let mut ack = InboundMessage::ack(id, json!({ "received": true }));
            if let Some(topic) = message.topic {
                ack = ack.with_topic(topic);
            }
            sink.deliver(ack);
        }
        Ok(())
    }

    fn supports_reauthentication(&self) -> bool {
        true
    }

    async fn reauthenticate(&self, token: &str) -> RealtimeResult<()> {
        self.check_token(Some(token))?;
        let mut session = self.session.lock();
        if session.sink.is_none() {
            return Err(RealtimeError::NotConnected);
        }
        session.token = Some(token.to_string());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        state::ConnectionEpoch,
        transport::TransportEvent,
        types::{CorrelationId, EventType},
    };

    fn sink() -> (
        EventSink,
        mpsc::UnboundedReceiver<(ConnectionEpoch, TransportEvent)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink::new(ConnectionEpoch(1), tx), rx)
    }

    #[tokio::test]
    async fn test_echo_to_wire_subscribers_only() {
        let transport = LoopbackTransport::new();
        let (sink, mut rx) = sink();
        transport.connect(None, sink).await.expect("connect");
        transport.subscribe(&Topic::new("room")).await.expect("subscribe");

        for topic in ["other", "room"] {
            transport
                .send(OutboundMessage {
                    event_type: EventType::new("chat"),
                    topic: Some(Topic::new(topic)),
                    payload: json!({"text": topic}),
                    correlation_id: None,
                })
                .await
                .expect("send");
        }

        let (_, event) = rx.recv().await.expect("echo");
        match event {
            TransportEvent::Message(message) => {
                assert_eq!(message.topic(), Some(&Topic::new("room")));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_correlated_send_is_acknowledged() {
        let transport = LoopbackTransport::new();
        let (sink, mut rx) = sink();
        transport.connect(None, sink).await.expect("connect");

        let id = CorrelationId::new();
        transport
            .send(OutboundMessage {
                event_type: EventType::new("ping"),
                topic: None,
                payload: json!({}),
                correlation_id: Some(id.clone()),
            })
            .await
            .expect("send");

        let (_, event) = rx.recv().await.expect("ack");
        let TransportEvent::Message(message) = event else {
            panic!("expected a message");
        };
        assert_eq!(message.event_type(), EventType::ACK);
        assert_eq!(message.correlation_id(), Some(&id));
    }

    #[tokio::test]
    async fn test_required_token() {
        let transport = LoopbackTransport::requiring_token("secret");
        let err = transport.connect(Some("wrong"), sink().0).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AuthFailed);

        transport.connect(Some("secret"), sink().0).await.expect("connect");
        assert!(transport.reauthenticate("wrong").await.is_err());
        assert_eq!(transport.presented_token().as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_drop_connection_reports_close() {
        let transport = LoopbackTransport::new();
        let (sink, mut rx) = sink();
        transport.connect(None, sink).await.expect("connect");

        assert!(transport.drop_connection("server restart"));
        assert!(!transport.is_connected());
        let (_, event) = rx.recv().await.expect("close");
        assert_eq!(
            event,
            TransportEvent::Closed {
                reason: "server restart".into()
            }
        );
    }
}
