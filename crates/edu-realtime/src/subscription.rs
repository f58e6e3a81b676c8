//! Lock-free subscription registry using `scc::HashMap`.
//!
//! Each [`Subscription`] is keyed by its own id, so several subscriptions may
//! target the same topic. Wire-level handles are attached once the provider
//! has confirmed the subscription.

use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{
    error::HandlerError,
    transport::WireHandle,
    types::{EventType, InboundMessage, MessageCallback, MessageFilter, SubscriptionId, Topic},
};

/// A handler scoped to one subscription.
#[derive(Clone)]
pub struct TopicHandler {
    event_type: Option<EventType>,
    callback: MessageCallback,
    filter: Option<MessageFilter>,
}

impl TopicHandler {
    /// Handle messages of `event_type` on the subscribed topic.
    pub fn new<F>(event_type: impl Into<EventType>, callback: F) -> Self
    where
        F: Fn(&InboundMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self {
            event_type: Some(event_type.into()),
            callback: Arc::new(callback),
            filter: None,
        }
    }

    /// Handle every message on the subscribed topic.
    pub fn any<F>(callback: F) -> Self
    where
        F: Fn(&InboundMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self {
            event_type: None,
            callback: Arc::new(callback),
            filter: None,
        }
    }

    /// Only invoke the callback when `filter` returns true.
    #[must_use]
    pub fn with_filter<P>(mut self, filter: P) -> Self
    where
        P: Fn(&InboundMessage) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub(crate) fn matches(&self, message: &InboundMessage) -> bool {
        let type_matches = self
            .event_type
            .as_ref()
            .is_none_or(|t| t.as_str() == message.event_type());
        type_matches && self.filter.as_ref().is_none_or(|f| f(message))
    }

    pub(crate) fn callback(&self) -> &MessageCallback {
        &self.callback
    }
}

impl fmt::Debug for TopicHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicHandler")
            .field("event_type", &self.event_type)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// Options for `subscribe`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubscribeOptions {
    /// Survive connection teardown and replay on the next connect.
    pub persistent: bool,
}

impl SubscribeOptions {
    pub fn persistent() -> Self {
        Self { persistent: true }
    }
}

/// A registered subscription.
#[derive(Clone, Debug)]
pub struct Subscription {
    id: SubscriptionId,
    seq: u64,
    topic: Topic,
    handlers: Arc<[TopicHandler]>,
    persistent: bool,
    wire: Option<WireHandle>,
}

impl Subscription {
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Whether the provider currently carries this subscription.
    pub fn is_wired(&self) -> bool {
        self.wire.is_some()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

/// Store of subscriptions keyed by id.
pub(crate) struct SubscriptionRegistry {
    subscriptions: scc::HashMap<SubscriptionId, Subscription>,
    next_seq: AtomicU64,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            subscriptions: scc::HashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Record a new subscription without a wire handle.
    pub(crate) fn insert(
        &self,
        topic: Topic,
        handlers: Vec<TopicHandler>,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        loop {
            let id = SubscriptionId::new();
            let subscription = Subscription {
                id: id.clone(),
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                topic: topic.clone(),
                handlers: handlers.clone().into(),
                persistent: options.persistent,
                wire: None,
            };
            if self.subscriptions.insert_sync(id.clone(), subscription).is_ok() {
                return id;
            }
        }
    }

    /// Attach the provider's handle. Returns `false` if the subscription was
    /// removed in the meantime; the caller then owns the handle.
    pub(crate) fn attach_wire(&self, id: &SubscriptionId, handle: WireHandle) -> bool {
        self.subscriptions
            .update_sync(id, |_, subscription| subscription.wire = Some(handle))
            .is_some()
    }

    /// Clear the wire slot if it still holds `handle`.
    pub(crate) fn detach_wire(&self, id: &SubscriptionId, handle: &WireHandle) {
        self.subscriptions.update_sync(id, |_, subscription| {
            if subscription.wire.as_ref() == Some(handle) {
                subscription.wire = None;
            }
        });
    }

    /// Remove a subscription, returning its wire handle if it had one.
    ///
    /// `None` means the id was unknown.
    pub(crate) fn remove(&self, id: &SubscriptionId) -> Option<Option<WireHandle>> {
        self.subscriptions
            .remove_sync(id)
            .map(|(_, subscription)| subscription.wire)
    }

    pub(crate) fn get(&self, id: &SubscriptionId) -> Option<Subscription> {
        self.subscriptions
            .update_sync(id, |_, subscription| subscription.clone())
    }

    /// Distinct topics with at least one subscription.
    pub(crate) fn active_topics(&self) -> BTreeSet<Topic> {
        let mut topics = BTreeSet::new();
        self.subscriptions.retain_sync(|_, subscription| {
            topics.insert(subscription.topic.clone());
            true
        });
        topics
    }

    /// Handlers for `topic`, in subscription registration order.
    pub(crate) fn handlers_for(&self, topic: &Topic) -> Vec<Arc<[TopicHandler]>> {
        let mut matched = Vec::new();
        self.subscriptions.retain_sync(|_, subscription| {
            if &subscription.topic == topic {
                matched.push((subscription.seq, subscription.handlers.clone()));
            }
            true
        });
        matched.sort_by_key(|(seq, _)| *seq);
        matched.into_iter().map(|(_, handlers)| handlers).collect()
    }

    /// Persistent subscriptions waiting for a wire handle, in
    /// registration order.
    pub(crate) fn deferred(&self) -> Vec<(SubscriptionId, Topic)> {
        let mut pending = Vec::new();
        self.subscriptions.retain_sync(|id, subscription| {
            if subscription.persistent && subscription.wire.is_none() {
                pending.push((subscription.seq, id.clone(), subscription.topic.clone()));
            }
            true
        });
        pending.sort_by_key(|(seq, _, _)| *seq);
        pending
            .into_iter()
            .map(|(_, id, topic)| (id, topic))
            .collect()
    }

    /// Apply connection teardown: drop non-persistent subscriptions and
    /// detach persistent ones from the dead connection.
    ///
    /// Returns the number of subscriptions removed.
    pub(crate) fn invalidate(&self) -> usize {
        let mut removed = 0;
        self.subscriptions.retain_sync(|_, subscription| {
            if subscription.persistent {
                subscription.wire = None;
                true
            } else {
                removed += 1;
                false
            }
        });
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub(crate) fn clear(&self) {
        self.subscriptions.clear_sync();
    }
}
