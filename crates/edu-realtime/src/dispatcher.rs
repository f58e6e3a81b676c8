//! Message dispatcher: routes inbound messages to global and
//! subscription-scoped handlers.
//!
//! Handlers run outside every lock, in registration order. A handler that
//! returns an error or panics is logged and skipped; the remaining handlers
//! still see the message.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    config::AckDelivery,
    error::HandlerError,
    hooks::{Detach, ListenerHandle},
    pending::PendingAckStore,
    subscription::SubscriptionRegistry,
    types::{EventType, InboundMessage, MessageCallback, MessageFilter},
};

struct GlobalHandler {
    id: u64,
    event_type: EventType,
    callback: MessageCallback,
    filter: Option<MessageFilter>,
    once: bool,
}

struct HandlerTable {
    next_id: AtomicU64,
    handlers: Mutex<Vec<GlobalHandler>>,
}

impl Detach for HandlerTable {
    fn detach(&self, id: u64) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|h| h.id != id);
        handlers.len() != before
    }
}

/// What happened to one inbound message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct DispatchReport {
    /// Round trip of the acknowledgment this message resolved.
    pub(crate) acknowledged: Option<Duration>,
    pub(crate) delivered: usize,
    pub(crate) failed: usize,
}

pub(crate) struct Dispatcher {
    table: Arc<HandlerTable>,
    ack_delivery: AckDelivery,
}

impl Dispatcher {
    pub(crate) fn new(ack_delivery: AckDelivery) -> Self {
        Self {
            table: Arc::new(HandlerTable {
                next_id: AtomicU64::new(1),
                handlers: Mutex::new(Vec::new()),
            }),
            ack_delivery,
        }
    }

    fn register(
        &self,
        event_type: EventType,
        callback: MessageCallback,
        filter: Option<MessageFilter>,
        once: bool,
    ) -> ListenerHandle {
        let id = self.table.next_id.fetch_add(1, Ordering::Relaxed);
        self.table.handlers.lock().push(GlobalHandler {
            id,
            event_type,
            callback,
            filter,
            once,
        });
        let owner: Arc<dyn Detach> = self.table.clone();
        ListenerHandle::new(id, Arc::downgrade(&owner))
    }

    pub(crate) fn on(
        &self,
        event_type: EventType,
        callback: MessageCallback,
        filter: Option<MessageFilter>,
    ) -> ListenerHandle {
        self.register(event_type, callback, filter, false)
    }

    pub(crate) fn once(&self, event_type: EventType, callback: MessageCallback) -> ListenerHandle {
        self.register(event_type, callback, None, true)
    }

    #[cfg(test)]
    pub(crate) fn handler_count(&self) -> usize {
        self.table.handlers.lock().len()
    }

    /// Discard every global handler. Pending `once` handlers are dropped
    /// without being invoked.
    pub(crate) fn teardown(&self) {
        self.table.handlers.lock().clear();
    }

    /// Route `message`.
    ///
    /// A message whose correlation id matches a pending acknowledgment
    /// resolves it; with [`AckDelivery::ResolveOnly`] routing stops there.
    pub(crate) fn dispatch(
        &self,
        message: &InboundMessage,
        subscriptions: &SubscriptionRegistry,
        pending: &PendingAckStore,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();

        if let Some(correlation_id) = message.correlation_id()
            && let Some(round_trip) = pending.resolve(correlation_id, message.clone())
        {
            report.acknowledged = Some(round_trip);
            if self.ack_delivery == AckDelivery::ResolveOnly {
                return report;
            }
        }

        for callback in self.take_global(message) {
            record(&mut report, invoke(&callback, message));
        }

        if let Some(topic) = message.topic() {
            for handlers in subscriptions.handlers_for(topic) {
                for handler in handlers.iter().filter(|h| h.matches(message)) {
                    record(&mut report, invoke(handler.callback(), message));
                }
            }
        }

        if report.delivered == 0 && report.failed == 0 {
            debug!(
                event_type = message.event_type(),
                topic = ?message.topic(),
                "No handler for inbound message"
            );
        }

        report
    }

    /// Matching global callbacks. `once` handlers are removed here, before
    /// they run, so each fires at most once.
    fn take_global(&self, message: &InboundMessage) -> Vec<MessageCallback> {
        let event_type = message.event_type();
        let mut handlers = self.table.handlers.lock();
        let mut selected = Vec::new();

        handlers.retain(|h| {
            let wanted = h.event_type.as_str() == event_type
                && h.filter.as_ref().is_none_or(|f| f(message));
            if !wanted {
                return true;
            }
            selected.push(h.callback.clone());
            !h.once
        });

        selected
    }
}

fn record(report: &mut DispatchReport, outcome: bool) {
    if outcome {
        report.delivered += 1;
    } else {
        report.failed += 1;
    }
}

fn invoke(callback: &MessageCallback, message: &InboundMessage) -> bool {
    match catch_unwind(AssertUnwindSafe(|| callback(message))) {
        Ok(Ok(())) => true,
        Ok(Err(error)) => {
            log_failure(message, &error);
            false
        }
        Err(_) => {
            warn!(
                event_type = message.event_type(),
                topic = ?message.topic(),
                "Message handler panicked; continuing"
            );
            false
        }
    }
}

fn log_failure(message: &InboundMessage, error: &HandlerError) {
    warn!(
        event_type = message.event_type(),
        topic = ?message.topic(),
        error = %error,
        "Message handler failed; continuing"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;
    use crate::{
        subscription::{SubscribeOptions, TopicHandler},
        types::{CorrelationId, Topic},
    };

    fn callback<F>(f: F) -> MessageCallback
    where
        F: Fn(&InboundMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    fn counter(hits: &Arc<AtomicUsize>) -> MessageCallback {
        let hits = hits.clone();
        callback(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn fixtures() -> (Dispatcher, SubscriptionRegistry, PendingAckStore) {
        (
            Dispatcher::new(AckDelivery::ResolveOnly),
            SubscriptionRegistry::new(),
            PendingAckStore::new(16),
        )
    }

    #[test]
    fn test_failing_handler_does_not_block_later_ones() {
        let (dispatcher, subs, pending) = fixtures();
        let hits = Arc::new(AtomicUsize::new(0));

        dispatcher.on("score".into(), callback(|_| Err("bad payload".into())), None);
        dispatcher.on("score".into(), callback(|_| panic!("handler bug")), None);
        dispatcher.on("score".into(), counter(&hits), None);

        let report = dispatcher.dispatch(
            &InboundMessage::event("score", None, json!(10)),
            &subs,
            &pending,
        );

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 2);
    }

    #[test]
    fn test_once_fires_exactly_once() {
        let (dispatcher, subs, pending) = fixtures();
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.once("quiz.start".into(), counter(&hits));

        let message = InboundMessage::event("quiz.start", None, json!({}));
        dispatcher.dispatch(&message, &subs, &pending);
        dispatcher.dispatch(&message, &subs, &pending);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.handler_count(), 0);
    }

    #[test]
    fn test_teardown_discards_once_handlers_silently() {
        let (dispatcher, subs, pending) = fixtures();
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.once("quiz.start".into(), counter(&hits));

        dispatcher.teardown();
        dispatcher.dispatch(
            &InboundMessage::event("quiz.start", None, json!({})),
            &subs,
            &pending,
        );
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_disposer_removes_only_its_handler() {
        let (dispatcher, subs, pending) = fixtures();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let handle = dispatcher.on("chat".into(), counter(&first), None);
        dispatcher.on("chat".into(), counter(&second), None);
        assert!(handle.dispose());

        dispatcher.dispatch(
            &InboundMessage::event("chat", None, json!("hi")),
            &subs,
            &pending,
        );
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_global_then_topic_handlers_in_order() {
        let (dispatcher, subs, pending) = fixtures();
        let order = Arc::new(Mutex::new(Vec::new()));

        let push = |tag: &'static str| {
            let order = order.clone();
            move |_: &InboundMessage| -> Result<(), HandlerError> {
                order.lock().push(tag);
                Ok(())
            }
        };

        subs.insert(
            Topic::new("room.1"),
            vec![
                TopicHandler::new("chat", push("sub-a")),
                TopicHandler::new("typing", push("never")),
            ],
            SubscribeOptions::default(),
        );
        subs.insert(
            Topic::new("room.1"),
            vec![TopicHandler::any(push("sub-b"))],
            SubscribeOptions::default(),
        );
        subs.insert(
            Topic::new("room.2"),
            vec![TopicHandler::any(push("other-room"))],
            SubscribeOptions::default(),
        );
        dispatcher.on("chat".into(), Arc::new(push("global")), None);

        dispatcher.dispatch(
            &InboundMessage::event("chat", Some("room.1".into()), json!({})),
            &subs,
            &pending,
        );

        assert_eq!(*order.lock(), vec!["global", "sub-a", "sub-b"]);
    }

    #[test]
    fn test_global_filter() {
        let (dispatcher, subs, pending) = fixtures();
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.on(
            "grade".into(),
            counter(&hits),
            Some(Arc::new(|m: &InboundMessage| m.payload()["score"] == json!(100))),
        );

        for score in [90, 100] {
            dispatcher.dispatch(
                &InboundMessage::event("grade", None, json!({ "score": score })),
                &subs,
                &pending,
            );
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ack_resolve_only_skips_handlers() {
        let (dispatcher, subs, pending) = fixtures();
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.on("ack".into(), counter(&hits), None);

        let id = CorrelationId::new();
        let _rx = pending
            .add(id.clone(), None, Duration::from_secs(1))
            .expect("capacity");

        let report = dispatcher.dispatch(&InboundMessage::ack(id, json!({})), &subs, &pending);
        assert!(report.acknowledged.is_some());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_ack_resolve_and_deliver() {
        let dispatcher = Dispatcher::new(AckDelivery::ResolveAndDeliver);
        let subs = SubscriptionRegistry::new();
        let pending = PendingAckStore::new(16);
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.on("ack".into(), counter(&hits), None);

        let id = CorrelationId::new();
        let _rx = pending
            .add(id.clone(), None, Duration::from_secs(1))
            .expect("capacity");

        let report = dispatcher.dispatch(&InboundMessage::ack(id, json!({})), &subs, &pending);
        assert!(report.acknowledged.is_some());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unmatched_ack_is_delivered_normally() {
        let (dispatcher, subs, pending) = fixtures();
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.on("ack".into(), counter(&hits), None);

        let report = dispatcher.dispatch(
            &InboundMessage::ack(CorrelationId::new(), json!({})),
            &subs,
            &pending,
        );
        assert!(report.acknowledged.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
