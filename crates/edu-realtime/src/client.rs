//! The real-time client: composition root of the connection layer.
//!
//! [`RealtimeClient`] owns one connection state machine, subscription
//! registry, dispatcher and stats block. It is cheap to clone; every clone
//! talks to the same connection. Nothing here is process-global, so
//! several independent clients can coexist (in tests, for instance).

use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    bridge::{StateStore, SyncBridge},
    config::RealtimeConfig,
    credentials::{CredentialLease, CredentialSource},
    dispatcher::Dispatcher,
    error::{HandlerError, RealtimeError, RealtimeResult},
    fallback::{self, FallbackController},
    flight::SingleFlight,
    hooks::{ListenerHandle, Listeners},
    pending::PendingAckStore,
    refresh::{self, RefreshCoordinator},
    state::{
        ConnectionEpoch, ConnectionState, ConnectionStats, StateMachine, StateTransition,
        StatsSnapshot, TransitionCause,
    },
    subscription::{SubscribeOptions, Subscription, SubscriptionRegistry, TopicHandler},
    transport::{EventSink, PollingSource, TransportEvent, TransportProvider, WireHandle},
    types::{
        CorrelationId, EventType, InboundMessage, MessageCallback, MessageFilter,
        OutboundMessage, SendOptions, SubscriptionId, Topic,
    },
};

/// Disconnect reason for a plain `disconnect()` call.
pub const CLIENT_DISCONNECT: &str = "client_disconnect";
const CLIENT_RECONNECT: &str = "client_reconnect";
const CLIENT_SHUTDOWN: &str = "client_shutdown";
const CONNECT_SUPERSEDED: &str = "connect_superseded";

type EventReceiver = mpsc::UnboundedReceiver<(ConnectionEpoch, TransportEvent)>;

pub(crate) struct Inner {
    pub(crate) config: RealtimeConfig,
    pub(crate) transport: Arc<dyn TransportProvider>,
    pub(crate) machine: StateMachine,
    pub(crate) stats: ConnectionStats,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) pending: PendingAckStore,
    pub(crate) credentials: RefreshCoordinator,
    pub(crate) fallback: FallbackController,
    pub(crate) refresh_and_reconnect: SingleFlight<()>,
    pub(crate) shutdown: CancellationToken,
    bridge: Option<Arc<SyncBridge>>,
    errors: Listeners<RealtimeError>,
    last_error: RwLock<Option<RealtimeError>>,
    epoch: Mutex<ConnectionEpoch>,
    connect_flight: SingleFlight<ConnectionEpoch>,
    retry: Mutex<CancellationToken>,
    events_tx: mpsc::UnboundedSender<(ConnectionEpoch, TransportEvent)>,
    events_rx: Mutex<Option<EventReceiver>>,
    has_connected: AtomicBool,
}

impl Inner {
    fn current_epoch(&self) -> ConnectionEpoch {
        *self.epoch.lock()
    }

    /// Token for retry tasks; replaced every time retries are cancelled.
    pub(crate) fn retry_token(&self) -> CancellationToken {
        self.retry.lock().clone()
    }

    fn cancel_retries(&self) {
        let mut retry = self.retry.lock();
        retry.cancel();
        *retry = self.shutdown.child_token();
    }

    /// Remember `error` as the last error and notify error observers.
    pub(crate) fn record_error(&self, error: &RealtimeError) {
        *self.last_error.write() = Some(error.clone());
        self.errors.emit(error);
    }

    /// Start the event pump and the expiry watcher on first use.
    fn ensure_background(self: &Arc<Self>) {
        let Some(rx) = self.events_rx.lock().take() else {
            return;
        };
        tokio::spawn(pump_events(
            Arc::downgrade(self),
            rx,
            self.shutdown.clone(),
        ));
        if let Some(signal) = self.credentials.expiry_signal() {
            refresh::spawn_expiry_watcher(self, signal, self.shutdown.clone());
        }
    }

    pub(crate) async fn connect(self: &Arc<Self>, explicit: Option<String>) -> RealtimeResult<()> {
        if !self.config.enabled {
            return Err(RealtimeError::Disabled);
        }
        if self.shutdown.is_cancelled() {
            return Err(RealtimeError::cancelled("client has been shut down"));
        }
        self.ensure_background();

        if self.machine.current().is_connected() {
            return Ok(());
        }

        // Replay runs once per handshake, in the caller that started it.
        let runner = self.clone();
        let mut started = false;
        let attempt = self.connect_flight.join_or_start(|| {
            started = true;
            async move { runner.connect_attempt(explicit).await }
        });
        let epoch = attempt.await?;
        if started {
            self.flush_deferred(epoch).await;
        }
        Ok(())
    }

    async fn connect_attempt(
        self: &Arc<Self>,
        explicit: Option<String>,
    ) -> RealtimeResult<ConnectionEpoch> {
        let recovering = match self.machine.current() {
            ConnectionState::Connected => return Ok(self.current_epoch()),
            ConnectionState::Polling => true,
            _ => {
                let started = self.machine.transition(
                    ConnectionState::Connecting,
                    TransitionCause::ConnectRequested,
                );
                if started.is_none() {
                    let state = self.machine.current();
                    return Err(RealtimeError::internal(format!(
                        "cannot start a handshake from {state}"
                    )));
                }
                false
            }
        };

        let token = self.credentials.resolve_token(explicit.as_deref());
        let epoch = {
            let mut current = self.epoch.lock();
            *current = current.next();
            *current
        };
        let sink = EventSink::new(epoch, self.events_tx.clone());
        debug!(
            transport = self.transport.name(),
            epoch = epoch.0,
            recovering,
            authenticated = token.is_some(),
            "Starting handshake"
        );

        let handshake = self.transport.connect(token.as_deref(), sink);
        let outcome = match tokio::time::timeout(self.config.connect_timeout, handshake).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(error.into_connect_failure()),
            Err(_) => Err(RealtimeError::connection_timeout(self.config.connect_timeout)),
        };

        match outcome {
            Ok(()) => self.handshake_succeeded(epoch, recovering).await,
            Err(error) => {
                self.handshake_failed(&error, recovering);
                Err(error)
            }
        }
    }

    async fn handshake_succeeded(
        self: &Arc<Self>,
        epoch: ConnectionEpoch,
        recovering: bool,
    ) -> RealtimeResult<ConnectionEpoch> {
        let (expected, cause) = if recovering {
            (ConnectionState::Polling, TransitionCause::RecoveredFromPolling)
        } else {
            (ConnectionState::Connecting, TransitionCause::HandshakeSucceeded)
        };
        if self
            .machine
            .transition_if(|state| state == expected, ConnectionState::Connected, cause)
            .is_none()
        {
            debug!("Handshake finished after the attempt was abandoned");
            self.transport.disconnect(CONNECT_SUPERSEDED).await;
            return Err(RealtimeError::cancelled("connection attempt superseded"));
        }

        self.fallback.on_connected();
        if self.has_connected.swap(true, Ordering::AcqRel) {
            self.stats.record_reconnect();
        }
        info!(epoch = epoch.0, "Connected");
        Ok(epoch)
    }

    fn handshake_failed(self: &Arc<Self>, error: &RealtimeError, recovering: bool) {
        warn!(error = %error, recovering, "Handshake failed");
        self.record_error(error);

        if recovering {
            return;
        }
        let failed = self.machine.transition_if(
            |state| state == ConnectionState::Connecting,
            ConnectionState::Error,
            TransitionCause::HandshakeFailed(error.kind()),
        );
        if failed.is_some() {
            fallback::after_failure(self, error.kind());
        }
    }

    /// Store `handle` on the subscription if the connection it was issued on
    /// is still live. Otherwise the handle is released and a persistent
    /// subscription stays deferred for the next connect.
    async fn bind_wire(
        &self,
        id: &SubscriptionId,
        topic: &Topic,
        handle: WireHandle,
        epoch: ConnectionEpoch,
    ) -> bool {
        let live = |inner: &Self| {
            inner.current_epoch() == epoch && inner.machine.current().is_connected()
        };

        let mut bound = live(self) && self.subscriptions.attach_wire(id, handle.clone());
        // A teardown between the check and the attach would miss this handle.
        if bound && !live(self) {
            self.subscriptions.detach_wire(id, &handle);
            bound = false;
        }
        if !bound && let Err(error) = self.transport.unsubscribe(&handle).await {
            debug!(error = %error, %topic, "Dropping stale wire subscription failed");
        }
        bound
    }

    /// Ask the provider for every persistent subscription still lacking a
    /// wire handle. Stops once the connection of `epoch` is gone.
    async fn flush_deferred(&self, epoch: ConnectionEpoch) {
        for (id, topic) in self.subscriptions.deferred() {
            if self.current_epoch() != epoch || !self.machine.current().is_connected() {
                return;
            }
            match self.transport.subscribe(&topic).await {
                Ok(handle) => {
                    if self.bind_wire(&id, &topic, handle, epoch).await {
                        debug!(%topic, subscription = %id, "Replayed persistent subscription");
                    }
                }
                Err(error) => {
                    warn!(error = %error, %topic, "Replaying persistent subscription failed");
                    self.record_error(&RealtimeError::subscription_failed(
                        topic.as_str(),
                        error.to_string(),
                    ));
                }
            }
        }
    }

    pub(crate) async fn disconnect(self: &Arc<Self>, reason: &str, user_initiated: bool) {
        self.cancel_retries();
        self.fallback.stop_polling();

        let cause = TransitionCause::Disconnect {
            reason: reason.to_string(),
            user_initiated,
        };
        let Some(applied) = self.machine.transition(ConnectionState::Disconnected, cause) else {
            debug!(reason, "Already disconnected");
            return;
        };

        self.teardown_session(reason);
        self.transport.disconnect(reason).await;
        info!(from = %applied.from, reason, "Disconnected");
    }

    pub(crate) async fn reconnect(self: &Arc<Self>) -> RealtimeResult<()> {
        self.disconnect(CLIENT_RECONNECT, true).await;
        tokio::time::sleep(self.config.reconnect_settle_delay).await;
        self.connect(None).await
    }

    /// Invalidate everything bound to the connection that just ended.
    fn teardown_session(&self, reason: &str) {
        let removed = self.subscriptions.invalidate();
        let cancelled = self.pending.clear_with_error(reason);
        debug!(
            removed_subscriptions = removed,
            cancelled_acks = cancelled,
            reason,
            "Session torn down"
        );
    }

    fn transport_closed(self: &Arc<Self>, reason: String) {
        let applied = self.machine.transition_if(
            |state| state == ConnectionState::Connected,
            ConnectionState::Reconnecting,
            TransitionCause::TransportClosed {
                reason: reason.clone(),
            },
        );
        if applied.is_none() {
            return;
        }

        warn!(%reason, "Transport closed the connection");
        self.teardown_session(&reason);

        if self.config.auto_retry {
            fallback::schedule_retry(self, None);
        } else {
            self.machine.transition(
                ConnectionState::Disconnected,
                TransitionCause::Disconnect {
                    reason,
                    user_initiated: false,
                },
            );
        }
    }

    fn handle_event(self: &Arc<Self>, epoch: ConnectionEpoch, event: TransportEvent) {
        if epoch != self.current_epoch() || !self.machine.current().is_connected() {
            debug!(epoch = epoch.0, "Dropping event from a stale or closed connection");
            return;
        }

        match event {
            TransportEvent::Message(message) => {
                self.stats.record_received();
                self.handle_inbound(message);
            }
            TransportEvent::Closed { reason } => self.transport_closed(reason),
        }
    }

    /// Route one inbound message, from the transport or from a poll.
    pub(crate) fn handle_inbound(&self, message: InboundMessage) {
        if self.config.debug_mode {
            debug!(
                event_type = message.event_type(),
                topic = ?message.topic(),
                correlation_id = ?message.correlation_id(),
                "Inbound message"
            );
        }

        match &message {
            InboundMessage::Notification(notification) => {
                if let Some(bridge) = &self.bridge {
                    bridge.forward_notification(notification);
                }
            }
            InboundMessage::Event(_) | InboundMessage::Ack(_) => {}
        }

        let report = self
            .dispatcher
            .dispatch(&message, &self.subscriptions, &self.pending);
        if let Some(round_trip) = report.acknowledged {
            self.stats.record_latency(round_trip);
        }
    }

    async fn subscribe(
        &self,
        topic: Topic,
        handlers: Vec<TopicHandler>,
        options: SubscribeOptions,
    ) -> RealtimeResult<SubscriptionId> {
        let connected = self.machine.current().is_connected();
        if !connected && !options.persistent {
            return Err(RealtimeError::NotConnected);
        }

        let id = self.subscriptions.insert(topic.clone(), handlers, options);
        if !connected {
            debug!(%topic, subscription = %id, "Deferred persistent subscription");
            return Ok(id);
        }

        let epoch = self.current_epoch();
        match self.transport.subscribe(&topic).await {
            Ok(handle) => {
                if self.bind_wire(&id, &topic, handle, epoch).await {
                    debug!(%topic, subscription = %id, "Subscribed");
                } else if options.persistent {
                    debug!(%topic, subscription = %id, "Connection changed while subscribing; deferred to next connect");
                }
                Ok(id)
            }
            Err(error) if options.persistent => {
                warn!(error = %error, %topic, "Wire subscription failed; deferred to next connect");
                Ok(id)
            }
            Err(error) => {
                self.subscriptions.remove(&id);
                Err(RealtimeError::subscription_failed(
                    topic.as_str(),
                    error.to_string(),
                ))
            }
        }
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let Some(wire) = self.subscriptions.remove(id) else {
            return false;
        };
        if let Some(handle) = wire
            && let Err(error) = self.transport.unsubscribe(&handle).await
        {
            warn!(error = %error, subscription = %id, "Wire unsubscribe failed");
        }
        true
    }

    async fn send(
        &self,
        event_type: EventType,
        payload: Value,
        options: SendOptions,
    ) -> RealtimeResult<Option<InboundMessage>> {
        if !self.machine.current().is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        self.pending.expire_overdue();

        let timeout = options.timeout.unwrap_or(self.config.ack_default_timeout);
        let ack = if options.await_ack {
            let id = CorrelationId::new();
            let rx = self.pending.add(id.clone(), options.topic.clone(), timeout)?;
            Some((id, rx))
        } else {
            None
        };

        let message = OutboundMessage {
            event_type,
            topic: options.topic,
            payload,
            correlation_id: ack.as_ref().map(|(id, _)| id.clone()),
        };
        if self.config.debug_mode {
            debug!(
                event_type = %message.event_type,
                topic = ?message.topic,
                correlation_id = ?message.correlation_id,
                "Outbound message"
            );
        }

        if let Err(error) = self.transport.send(message).await {
            if let Some((id, _)) = &ack {
                self.pending.remove(id);
            }
            return Err(match error {
                RealtimeError::SendFailed { .. } => error,
                other => RealtimeError::send_failed(other.to_string()),
            });
        }
        self.stats.record_sent();

        let Some((id, rx)) = ack else {
            return Ok(None);
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result.map(Some),
            Ok(Err(_)) => Err(RealtimeError::cancelled("acknowledgment abandoned")),
            Err(_) => {
                self.pending.remove(&id);
                Err(RealtimeError::ack_timeout(id.to_string(), timeout))
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn pump_events(
    weak: std::sync::Weak<Inner>,
    mut rx: EventReceiver,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => next,
        };
        let Some((epoch, event)) = next else {
            break;
        };
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.handle_event(epoch, event);
    }
    debug!("Event pump stopped");
}

/// Real-time connection client.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use edu_realtime::{LoopbackTransport, RealtimeClient, RealtimeConfig, SendOptions, TopicHandler};
///
/// # async fn run() -> edu_realtime::RealtimeResult<()> {
/// let client = RealtimeClient::builder(Arc::new(LoopbackTransport::new()))
///     .config(RealtimeConfig::from_env()?)
///     .build()?;
///
/// client.connect().await?;
/// client
///     .subscribe(
///         "quiz.42",
///         vec![TopicHandler::new("answer", |msg| {
///             println!("answer: {}", msg.payload());
///             Ok(())
///         })],
///         Default::default(),
///     )
///     .await?;
/// client
///     .send("answer", serde_json::json!({"choice": 2}), SendOptions::new().topic("quiz.42"))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<Inner>,
}

impl RealtimeClient {
    /// Start building a client around `transport`.
    pub fn builder(transport: Arc<dyn TransportProvider>) -> RealtimeClientBuilder {
        RealtimeClientBuilder::new(transport)
    }

    /// Client with `config` and no credential source, polling source or store.
    pub fn new(config: RealtimeConfig, transport: Arc<dyn TransportProvider>) -> RealtimeResult<Self> {
        Self::builder(transport).config(config).build()
    }

    /// Connect using the current credential.
    ///
    /// Returns immediately when already connected and joins the in-flight
    /// attempt when one is running. While polling, this performs an
    /// immediate recovery handshake.
    pub async fn connect(&self) -> RealtimeResult<()> {
        self.inner.connect(None).await
    }

    /// Connect with an explicit token instead of the current lease.
    pub async fn connect_with_token(&self, token: impl Into<String>) -> RealtimeResult<()> {
        self.inner.connect(Some(token.into())).await
    }

    /// Disconnect. A second call is a no-op.
    pub async fn disconnect(&self, reason: Option<&str>) {
        self.inner
            .disconnect(reason.unwrap_or(CLIENT_DISCONNECT), true)
            .await;
    }

    /// Disconnect, wait the settle delay, connect again.
    pub async fn reconnect(&self) -> RealtimeResult<()> {
        self.inner.reconnect().await
    }

    /// Refresh the credential, then reconnect with it.
    pub async fn refresh_token_and_reconnect(&self) -> RealtimeResult<()> {
        refresh::refresh_token_and_reconnect(&self.inner).await
    }

    /// Register a subscription on `topic`.
    ///
    /// Fails with `NotConnected` while disconnected unless `options` marks
    /// the subscription persistent, in which case it is replayed on the
    /// next successful connect.
    pub async fn subscribe(
        &self,
        topic: impl Into<Topic>,
        handlers: Vec<TopicHandler>,
        options: SubscribeOptions,
    ) -> RealtimeResult<SubscriptionId> {
        self.inner.subscribe(topic.into(), handlers, options).await
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        self.inner.unsubscribe(id).await
    }

    pub fn subscription(&self, id: &SubscriptionId) -> Option<Subscription> {
        self.inner.subscriptions.get(id)
    }

    pub fn list_active_topics(&self) -> BTreeSet<Topic> {
        self.inner.subscriptions.active_topics()
    }

    /// Handle every message of `event_type`, on any topic.
    pub fn on<F>(&self, event_type: impl Into<EventType>, handler: F) -> ListenerHandle
    where
        F: Fn(&InboundMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.inner
            .dispatcher
            .on(event_type.into(), Arc::new(handler), None)
    }

    /// Like [`on`](Self::on), but only for messages accepted by `filter`.
    ///
    /// The filter runs while the handler table is locked and must not
    /// register or dispose handlers.
    pub fn on_filtered<P, F>(
        &self,
        event_type: impl Into<EventType>,
        filter: P,
        handler: F,
    ) -> ListenerHandle
    where
        P: Fn(&InboundMessage) -> bool + Send + Sync + 'static,
        F: Fn(&InboundMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let filter: MessageFilter = Arc::new(filter);
        let handler: MessageCallback = Arc::new(handler);
        self.inner
            .dispatcher
            .on(event_type.into(), handler, Some(filter))
    }

    /// Handle the next message of `event_type` only.
    pub fn once<F>(&self, event_type: impl Into<EventType>, handler: F) -> ListenerHandle
    where
        F: Fn(&InboundMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.inner
            .dispatcher
            .once(event_type.into(), Arc::new(handler))
    }

    /// Send a message.
    ///
    /// With `await_ack` set, resolves with the correlated acknowledgment or
    /// fails with `AckTimeout`; otherwise resolves with `None` once the
    /// transport accepted the message.
    pub async fn send(
        &self,
        event_type: impl Into<EventType>,
        payload: Value,
        options: SendOptions,
    ) -> RealtimeResult<Option<InboundMessage>> {
        self.inner.send(event_type.into(), payload, options).await
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.machine.current()
    }

    /// Receiver that always holds the latest state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.machine.watch()
    }

    /// Observe every state transition, synchronously.
    pub fn on_state_change<F>(&self, observer: F) -> ListenerHandle
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.inner.machine.observers().add(observer)
    }

    /// Observe classified connection errors.
    pub fn on_error<F>(&self, observer: F) -> ListenerHandle
    where
        F: Fn(&RealtimeError) + Send + Sync + 'static,
    {
        self.inner.errors.add(observer)
    }

    pub fn last_error(&self) -> Option<RealtimeError> {
        self.inner.last_error.read().clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.inner.stats.reset();
        if let Some(bridge) = &self.inner.bridge {
            bridge.on_stats(self.inner.stats.snapshot());
        }
    }

    pub fn credential_lease(&self) -> Option<Arc<CredentialLease>> {
        self.inner.credentials.lease()
    }

    /// Number of sends still waiting for an acknowledgment.
    pub fn pending_acks(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    /// Disconnect and stop every background task.
    ///
    /// Global handlers (including pending `once` handlers), subscriptions
    /// and observers are discarded without being invoked. The client cannot
    /// connect again afterwards.
    pub async fn shutdown(&self) {
        self.inner.disconnect(CLIENT_SHUTDOWN, true).await;
        self.inner.shutdown.cancel();
        self.inner.cancel_retries();
        self.inner.fallback.stop_polling();
        self.inner.dispatcher.teardown();
        self.inner.subscriptions.clear();
        self.inner.pending.clear_with_error(CLIENT_SHUTDOWN);
        self.inner.machine.observers().clear();
        self.inner.errors.clear();
        info!("Real-time client shut down");
    }
}

impl fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("state", &self.state())
            .field("transport", &self.inner.transport.name())
            .field("subscriptions", &self.inner.subscriptions.len())
            .field("pending_acks", &self.inner.pending.len())
            .finish()
    }
}

/// Builder for [`RealtimeClient`].
pub struct RealtimeClientBuilder {
    transport: Arc<dyn TransportProvider>,
    config: RealtimeConfig,
    credentials: Option<Arc<dyn CredentialSource>>,
    polling: Option<Arc<dyn PollingSource>>,
    store: Option<Arc<dyn StateStore>>,
}

impl RealtimeClientBuilder {
    fn new(transport: Arc<dyn TransportProvider>) -> Self {
        Self {
            transport,
            config: RealtimeConfig::default(),
            credentials: None,
            polling: None,
            store: None,
        }
    }

    #[must_use]
    pub fn config(mut self, config: RealtimeConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn credentials(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(source);
        self
    }

    /// Endpoint polled while the transport is unavailable.
    #[must_use]
    pub fn polling_source(mut self, source: Arc<dyn PollingSource>) -> Self {
        self.polling = Some(source);
        self
    }

    /// Store that mirrors connection state and notifications.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> RealtimeResult<RealtimeClient> {
        self.config.validate().map_err(RealtimeError::config)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let bridge = self
            .store
            .map(|store| Arc::new(SyncBridge::new(store, self.config.notify_on_fallback)));

        let inner = Arc::new(Inner {
            transport: self.transport,
            machine: StateMachine::new(),
            stats: ConnectionStats::new(),
            subscriptions: SubscriptionRegistry::new(),
            dispatcher: Dispatcher::new(self.config.ack_delivery),
            pending: PendingAckStore::new(self.config.max_pending_acks),
            credentials: RefreshCoordinator::new(self.credentials),
            fallback: FallbackController::new(&self.config, self.polling),
            refresh_and_reconnect: SingleFlight::new(),
            retry: Mutex::new(shutdown.child_token()),
            shutdown,
            bridge: bridge.clone(),
            errors: Listeners::new("error"),
            last_error: RwLock::new(None),
            epoch: Mutex::new(ConnectionEpoch::default()),
            connect_flight: SingleFlight::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            has_connected: AtomicBool::new(false),
            config: self.config,
        });

        if let Some(bridge) = bridge {
            let weak = Arc::downgrade(&inner);
            // Lives until shutdown clears the observers.
            let _mirror = inner.machine.observers().add(move |transition| {
                let stats = weak
                    .upgrade()
                    .map(|inner| inner.stats.snapshot())
                    .unwrap_or_default();
                bridge.on_transition(transition, stats);
            });
        }

        Ok(RealtimeClient { inner })
    }
}
