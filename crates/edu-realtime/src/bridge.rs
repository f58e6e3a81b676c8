//! State synchronization bridge.
//!
//! Mirrors connection state, user-facing notifications and stats into an
//! application-owned [`StateStore`]. The bridge only writes; it never reads
//! business state back. Store failures are logged and dropped so they can
//! never reach the dispatch path.

use std::{
    collections::VecDeque,
    fmt,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    config::RealtimeConfig,
    error::ErrorKind,
    refresh::TOKEN_REFRESH_FAILED,
    state::{ConnectionState, StateTransition, StatsSnapshot, TransitionCause},
    types::NotificationMessage,
};

/// Severity of a user-facing notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    /// Parse a wire severity; anything unrecognised becomes `Info`.
    pub fn parse_lossy(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "success" => Self::Success,
            "warning" | "warn" => Self::Warning,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// A notification shown to the user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub severity: Severity,
    pub message: String,
    /// The user may close it.
    pub dismissible: bool,
    /// Blocks interaction until the user acts on it.
    pub blocking: bool,
    pub created_at_ms: u64,
}

impl Notification {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        let created_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        Self {
            id: ulid::Ulid::new().to_string(),
            severity,
            message: message.into(),
            dismissible: true,
            blocking: false,
            created_at_ms,
        }
    }

    #[must_use]
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self.dismissible = false;
        self
    }
}

/// Mutation accepted by a [`StateStore`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum StoreAction {
    ConnectionStateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    NotificationAdded(Notification),
    StatsUpdated(StatsSnapshot),
}

impl StoreAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionStateChanged { .. } => "connectionStateChanged",
            Self::NotificationAdded(_) => "notificationAdded",
            Self::StatsUpdated(_) => "statsUpdated",
        }
    }
}

/// Error returned by a [`StateStore`] that refused a mutation.
#[derive(Debug, Error)]
#[error("State store rejected {action}: {message}")]
pub struct StoreError {
    pub action: &'static str,
    pub message: String,
}

impl StoreError {
    pub fn new(action: &'static str, message: impl Into<String>) -> Self {
        Self {
            action,
            message: message.into(),
        }
    }
}

/// Application state store, written to by the bridge.
///
/// `apply` runs on the dispatch path and must not block.
pub trait StateStore: Send + Sync + 'static {
    fn apply(&self, action: StoreAction) -> Result<(), StoreError>;
}

pub(crate) const CONNECTED_MESSAGE: &str = "Live updates connected";
pub(crate) const CONNECTION_LOST_MESSAGE: &str = "Connection lost, retrying";
pub(crate) const LOGIN_REQUIRED_MESSAGE: &str = "Your session has expired, please log in again";
pub(crate) const FALLBACK_MESSAGE: &str = "Live updates unavailable, refreshing periodically";

/// Translates connection events into store mutations.
pub(crate) struct SyncBridge {
    store: Arc<dyn StateStore>,
    notify_on_fallback: bool,
}

impl SyncBridge {
    pub(crate) fn new(store: Arc<dyn StateStore>, notify_on_fallback: bool) -> Self {
        Self {
            store,
            notify_on_fallback,
        }
    }

    fn apply(&self, action: StoreAction) {
        let name = action.name();
        if let Err(error) = self.store.apply(action) {
            warn!(action = name, error = %error, "State store mutation failed");
        }
    }

    pub(crate) fn on_transition(&self, transition: &StateTransition, stats: StatsSnapshot) {
        self.apply(StoreAction::ConnectionStateChanged {
            from: transition.from,
            to: transition.to,
        });
        if let Some(notification) = self.notification_for(transition) {
            self.apply(StoreAction::NotificationAdded(notification));
        }
        self.apply(StoreAction::StatsUpdated(stats));
    }

    fn notification_for(&self, transition: &StateTransition) -> Option<Notification> {
        use ConnectionState::*;

        match (transition.from, transition.to, &transition.cause) {
            (_, Connected, _) => Some(Notification::new(Severity::Success, CONNECTED_MESSAGE)),
            (
                Connected,
                Disconnected,
                TransitionCause::Disconnect {
                    user_initiated: true,
                    ..
                },
            ) => None,
            (_, Disconnected, TransitionCause::Disconnect { reason, .. })
                if reason == TOKEN_REFRESH_FAILED =>
            {
                Some(Notification::new(Severity::Error, LOGIN_REQUIRED_MESSAGE).blocking())
            }
            (Connected, Disconnected | Reconnecting, _) => Some(Notification::new(
                Severity::Warning,
                CONNECTION_LOST_MESSAGE,
            )),
            (_, Error, TransitionCause::HandshakeFailed(ErrorKind::AuthFailed)) => {
                Some(Notification::new(Severity::Error, LOGIN_REQUIRED_MESSAGE).blocking())
            }
            (_, Polling, _) if self.notify_on_fallback => {
                Some(Notification::new(Severity::Info, FALLBACK_MESSAGE))
            }
            _ => None,
        }
    }

    /// Forward a system notification received from the server.
    pub(crate) fn forward_notification(&self, message: &NotificationMessage) {
        let severity = Severity::parse_lossy(&message.severity);
        if severity == Severity::Info && !message.severity.eq_ignore_ascii_case("info") {
            debug!(severity = %message.severity, "Unknown notification severity; using info");
        }
        self.apply(StoreAction::NotificationAdded(Notification::new(
            severity,
            message.message.clone(),
        )));
    }

    pub(crate) fn on_stats(&self, stats: StatsSnapshot) {
        self.apply(StoreAction::StatsUpdated(stats));
    }
}

struct MemoryState {
    connection_state: ConnectionState,
    notifications: VecDeque<Notification>,
    dropped: u64,
    stats: StatsSnapshot,
}

/// In-memory [`StateStore`] with a bounded notification queue.
///
/// When the queue is full the oldest notification is dropped.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    capacity: usize,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                connection_state: ConnectionState::Disconnected,
                notifications: VecDeque::with_capacity(capacity.min(1024)),
                dropped: 0,
                stats: StatsSnapshot::default(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Store sized by `notification_queue_capacity`.
    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self::new(config.notification_queue_capacity)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection_state
    }

    /// Queued notifications, oldest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.state.lock().notifications.iter().cloned().collect()
    }

    /// Notifications evicted because the queue was full.
    pub fn dropped_notifications(&self) -> u64 {
        self.state.lock().dropped
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.state.lock().stats
    }

    /// Remove a dismissible notification. Blocking ones stay.
    pub fn dismiss(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.notifications.len();
        state
            .notifications
            .retain(|n| n.id != id || !n.dismissible);
        state.notifications.len() != before
    }

    pub fn clear_notifications(&self) {
        self.state.lock().notifications.clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(100)
    }
}

impl StateStore for MemoryStore {
    fn apply(&self, action: StoreAction) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        match action {
            StoreAction::ConnectionStateChanged { to, .. } => state.connection_state = to,
            StoreAction::NotificationAdded(notification) => {
                while state.notifications.len() >= self.capacity {
                    state.notifications.pop_front();
                    state.dropped += 1;
                }
                state.notifications.push_back(notification);
            }
            StoreAction::StatsUpdated(stats) => state.stats = stats,
        }
        Ok(())
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryStore")
            .field("connection_state", &state.connection_state)
            .field("notifications", &state.notifications.len())
            .field("dropped", &state.dropped)
            .field("capacity", &self.capacity)
            .finish()
    }
}
