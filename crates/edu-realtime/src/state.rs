//! Connection state machine: states, legal edges, transition records and
//! connection statistics.

use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use parking_lot::ReentrantMutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{error::ErrorKind, hooks::Listeners};

/// Incremented on every handshake attempt. Events stamped with an older
/// epoch belong to a connection that no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ConnectionEpoch(pub u64);

impl ConnectionEpoch {
    pub(crate) fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Connection state machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Not connected and not trying to be.
    Disconnected,
    /// A handshake is in flight.
    Connecting,
    /// Connected and ready for traffic.
    Connected,
    /// Lost the connection; a retry is scheduled.
    Reconnecting,
    /// The last handshake failed.
    Error,
    /// Degraded mode: polling instead of receiving pushes.
    Polling,
}

impl ConnectionState {
    /// Whether the machine may move from `self` to `next`.
    ///
    /// Self-transitions are not edges.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected | Error | Disconnected)
                | (Connected, Disconnected | Reconnecting)
                | (Reconnecting, Connecting | Disconnected | Polling)
                | (Error, Connecting | Polling | Disconnected | Reconnecting)
                | (Polling, Connected | Disconnected)
        )
    }

    /// Check if the connection is ready for traffic.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Connecting or connected.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Error => "ERROR",
            Self::Polling => "POLLING",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a transition happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionCause {
    /// `connect()` or a retry started a handshake.
    ConnectRequested,
    /// The provider accepted the handshake.
    HandshakeSucceeded,
    /// The provider rejected the handshake.
    HandshakeFailed(ErrorKind),
    /// Explicit disconnect. `user_initiated` is false for disconnects the
    /// client forces itself, such as after a failed token refresh.
    Disconnect {
        reason: String,
        user_initiated: bool,
    },
    /// The transport dropped a live connection.
    TransportClosed { reason: String },
    /// A backoff retry was scheduled after a failure.
    RetryScheduled,
    /// The failure budget was exhausted.
    FallbackEngaged,
    /// A background recovery attempt succeeded while polling.
    RecoveredFromPolling,
}

/// A single applied transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub cause: TransitionCause,
}

struct Cursor {
    state: ConnectionState,
    queue: VecDeque<StateTransition>,
    draining: bool,
}

/// Owner of the current [`ConnectionState`].
///
/// Transitions are serialised through a re-entrant gate. Observers run
/// synchronously inside [`transition`](Self::transition); a transition
/// requested by an observer is queued and published after the current one,
/// so every observer sees transitions in the order they were applied.
pub(crate) struct StateMachine {
    gate: ReentrantMutex<RefCell<Cursor>>,
    watch_tx: watch::Sender<ConnectionState>,
    observers: Listeners<StateTransition>,
}

impl StateMachine {
    pub(crate) fn new() -> Self {
        let (watch_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            gate: ReentrantMutex::new(RefCell::new(Cursor {
                state: ConnectionState::Disconnected,
                queue: VecDeque::new(),
                draining: false,
            })),
            watch_tx,
            observers: Listeners::new("state"),
        }
    }

    pub(crate) fn current(&self) -> ConnectionState {
        self.gate.lock().borrow().state
    }

    pub(crate) fn observers(&self) -> &Listeners<StateTransition> {
        &self.observers
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.watch_tx.subscribe()
    }

    /// Move to `to` if that is a legal edge from the current state.
    pub(crate) fn transition(
        &self,
        to: ConnectionState,
        cause: TransitionCause,
    ) -> Option<StateTransition> {
        self.transition_if(|_| true, to, cause)
    }

    /// Move to `to` only if `guard` accepts the current state and the edge
    /// is legal. Returns the applied transition.
    pub(crate) fn transition_if<F>(
        &self,
        guard: F,
        to: ConnectionState,
        cause: TransitionCause,
    ) -> Option<StateTransition>
    where
        F: FnOnce(ConnectionState) -> bool,
    {
        let gate = self.gate.lock();

        let applied = {
            let mut cursor = gate.borrow_mut();
            let from = cursor.state;
            if from == to || !guard(from) {
                return None;
            }
            if !from.can_transition_to(to) {
                warn!(%from, %to, ?cause, "Refusing illegal state transition");
                return None;
            }
            cursor.state = to;
            let applied = StateTransition { from, to, cause };
            cursor.queue.push_back(applied.clone());
            if cursor.draining {
                return Some(applied);
            }
            cursor.draining = true;
            applied
        };

        loop {
            let next = {
                let mut cursor = gate.borrow_mut();
                match cursor.queue.pop_front() {
                    Some(next) => next,
                    None => {
                        cursor.draining = false;
                        break;
                    }
                }
            };
            debug!(from = %next.from, to = %next.to, cause = ?next.cause, "Connection state changed");
            self.watch_tx.send_replace(next.to);
            self.observers.emit(&next);
        }

        Some(applied)
    }
}

/// Monotonic connection counters. Reset only by an explicit call.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    reconnect_count: AtomicU64,
    last_latency_ms: AtomicU64,
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reconnect_count: u64,
    /// Round trip of the most recent acknowledgment.
    pub last_latency_ms: u64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.last_latency_ms.store(millis, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
            last_latency_ms: self.last_latency_ms.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.messages_sent.store(0, Ordering::Relaxed);
        self.messages_received.store(0, Ordering::Relaxed);
        self.reconnect_count.store(0, Ordering::Relaxed);
        self.last_latency_ms.store(0, Ordering::Relaxed);
    }
}
