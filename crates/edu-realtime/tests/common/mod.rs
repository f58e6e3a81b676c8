#![allow(dead_code)]

use std::{
    collections::{BTreeSet, VecDeque},
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use edu_realtime::{
    CredentialLease, CredentialSource, EventSink, InboundMessage, OutboundMessage, PollingSource,
    RealtimeConfig, RealtimeError, RealtimeResult, Topic, TransportProvider, WireHandle,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{Notify, broadcast};

/// Config with short delays so retry paths finish quickly.
pub fn fast_config() -> RealtimeConfig {
    RealtimeConfig::new()
        .reconnect_base_delay(Duration::from_millis(10))
        .reconnect_max_delay(Duration::from_millis(40))
        .reconnect_jitter(0.0)
        .reconnect_settle_delay(Duration::ZERO)
        .connect_timeout(Duration::from_millis(500))
        .fallback_failure_threshold(5)
        .fallback_window(Duration::from_secs(60))
        .poll_interval(Duration::from_millis(20))
        .polling_recovery_interval(Duration::from_millis(30))
        .token_refresh_retry_delay(Duration::from_millis(20))
}

/// Poll `condition` until it holds or `limit` passes.
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `future` or panic after two seconds.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("operation timed out")
}

/// Scriptable transport that records every call.
#[derive(Default)]
pub struct FakeTransport {
    pub connect_calls: AtomicUsize,
    pub disconnect_reasons: Mutex<Vec<String>>,
    pub subscribed: Mutex<Vec<Topic>>,
    pub unsubscribed: Mutex<Vec<WireHandle>>,
    pub sent: Mutex<Vec<OutboundMessage>>,
    pub tokens: Mutex<Vec<Option<String>>>,
    pub reauth_tokens: Mutex<Vec<String>>,
    connect_failures: Mutex<VecDeque<RealtimeError>>,
    fail_connect: Mutex<Option<RealtimeError>>,
    connect_delay: Mutex<Duration>,
    fail_subscribe: AtomicBool,
    subscribe_gate: Mutex<Option<Arc<Notify>>>,
    fail_send: AtomicBool,
    auto_ack: AtomicBool,
    reauth: AtomicBool,
    fail_reauth: AtomicBool,
    sinks: Mutex<Vec<EventSink>>,
    next_handle: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_reauthentication() -> Arc<Self> {
        let transport = Self::default();
        transport.reauth.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    /// Fail the next `count` handshakes with `error`.
    pub fn fail_next_connects(&self, count: usize, error: RealtimeError) {
        let mut queue = self.connect_failures.lock();
        for _ in 0..count {
            queue.push_back(error.clone());
        }
    }

    /// Fail every handshake until cleared with `None`.
    pub fn fail_connects(&self, error: Option<RealtimeError>) {
        *self.fail_connect.lock() = error;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    pub fn fail_subscribes(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Park wire subscribes until [`release_subscribes`](Self::release_subscribes).
    pub fn hold_subscribes(&self) {
        *self.subscribe_gate.lock() = Some(Arc::new(Notify::new()));
    }

    /// Let parked subscribes finish; later ones complete immediately.
    pub fn release_subscribes(&self) {
        if let Some(gate) = self.subscribe_gate.lock().take() {
            gate.notify_waiters();
            gate.notify_one();
        }
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reauthentication(&self, fail: bool) {
        self.fail_reauth.store(fail, Ordering::SeqCst);
    }

    /// Acknowledge every correlated send.
    pub fn auto_ack(&self, enabled: bool) {
        self.auto_ack.store(enabled, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnect_reasons.lock().len()
    }

    pub fn subscribed_topics(&self) -> Vec<Topic> {
        self.subscribed.lock().clone()
    }

    fn latest_sink(&self) -> Option<EventSink> {
        self.sinks.lock().last().cloned()
    }

    /// Deliver through the most recent connection's sink.
    pub fn inject(&self, message: InboundMessage) -> bool {
        self.latest_sink().is_some_and(|sink| sink.deliver(message))
    }

    /// Deliver through the sink of the `index`-th handshake.
    pub fn inject_via(&self, index: usize, message: InboundMessage) -> bool {
        let sink = self.sinks.lock().get(index).cloned();
        sink.is_some_and(|sink| sink.deliver(message))
    }

    /// Report an unsolicited close on the current connection.
    pub fn close(&self, reason: &str) -> bool {
        self.latest_sink().is_some_and(|sink| sink.closed(reason))
    }
}

#[async_trait]
impl TransportProvider for FakeTransport {
    async fn connect(&self, token: Option<&str>, sink: EventSink) -> RealtimeResult<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().push(token.map(str::to_string));

        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.connect_failures.lock().pop_front() {
            return Err(error);
        }
        if let Some(error) = self.fail_connect.lock().clone() {
            return Err(error);
        }
        self.sinks.lock().push(sink);
        Ok(())
    }

    async fn disconnect(&self, reason: &str) {
        self.disconnect_reasons.lock().push(reason.to_string());
    }

    async fn subscribe(&self, topic: &Topic) -> RealtimeResult<WireHandle> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(RealtimeError::connection_failed("subscribe rejected"));
        }
        self.subscribed.lock().push(topic.clone());
        let gate = self.subscribe_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let n = self.next_handle.fetch_add(1, Ordering::SeqCst);
        Ok(WireHandle::new(format!("{topic}#{n}")))
    }

    async fn unsubscribe(&self, handle: &WireHandle) -> RealtimeResult<()> {
        self.unsubscribed.lock().push(handle.clone());
        Ok(())
    }

    async fn send(&self, message: OutboundMessage) -> RealtimeResult<()> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(RealtimeError::connection_failed("socket closed"));
        }
        let ack = message
            .correlation_id
            .clone()
            .filter(|_| self.auto_ack.load(Ordering::SeqCst));
        self.sent.lock().push(message);
        if let Some(id) = ack {
            self.inject(InboundMessage::ack(id, json!({ "ok": true })));
        }
        Ok(())
    }

    fn supports_reauthentication(&self) -> bool {
        self.reauth.load(Ordering::SeqCst)
    }

    async fn reauthenticate(&self, token: &str) -> RealtimeResult<()> {
        if self.fail_reauth.load(Ordering::SeqCst) {
            return Err(RealtimeError::auth("token rejected"));
        }
        self.reauth_tokens.lock().push(token.to_string());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Credential source issuing `token-1`, `token-2`, ... on refresh.
pub struct FakeCredentials {
    pub refresh_calls: AtomicUsize,
    current: Mutex<Option<String>>,
    fail: AtomicBool,
    delay: Mutex<Duration>,
    expiry: broadcast::Sender<()>,
}

impl FakeCredentials {
    pub fn new(initial: &str) -> Arc<Self> {
        let (expiry, _) = broadcast::channel(4);
        Arc::new(Self {
            refresh_calls: AtomicUsize::new(0),
            current: Mutex::new(Some(initial.to_string())),
            fail: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            expiry,
        })
    }

    pub fn fail_refresh(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Fire the expiry signal.
    pub fn expire(&self) {
        let _ = self.expiry.send(());
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialSource for FakeCredentials {
    fn current_token(&self) -> Option<String> {
        self.current.lock().clone()
    }

    async fn refresh(&self) -> RealtimeResult<CredentialLease> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(RealtimeError::auth("refresh token revoked"));
        }
        let token = format!("token-{n}");
        *self.current.lock() = Some(token.clone());
        Ok(CredentialLease::expiring_in(token, Duration::from_secs(300)))
    }

    fn expiry_signal(&self) -> Option<broadcast::Receiver<()>> {
        Some(self.expiry.subscribe())
    }
}

/// Polling endpoint returning queued batches.
#[derive(Default)]
pub struct FakePoller {
    pub polls: AtomicUsize,
    pub seen_topics: Mutex<Vec<BTreeSet<Topic>>>,
    batches: Mutex<VecDeque<Vec<InboundMessage>>>,
}

impl FakePoller {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_batch(&self, batch: Vec<InboundMessage>) {
        self.batches.lock().push_back(batch);
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PollingSource for FakePoller {
    async fn poll(&self, topics: &BTreeSet<Topic>) -> RealtimeResult<Vec<InboundMessage>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.seen_topics.lock().push(topics.clone());
        Ok(self.batches.lock().pop_front().unwrap_or_default())
    }
}
